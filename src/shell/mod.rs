//! Shell builtins (component F): pure, in-process implementations of common
//! POSIX-style file commands. New relative to the teacher (whose `run.rs` always
//! shells out to a real `sh`/`cmd`), but built from the same
//! `std::process::Command`-adjacent "capture output, report an exit code" shape
//! the teacher's lifecycle-script runner uses — generalized here into handlers
//! that never spawn a subprocess.

mod builtins;

pub use builtins::{ExitCode, Shell, run_builtin};
