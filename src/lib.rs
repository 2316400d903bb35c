//! `devcore` — the in-process command router, npm-lite package manager,
//! script runner, and developer-preview server backing a mobile IDE.
//!
//! Organized by component, each module grounded on the matching piece of the
//! teacher repo (`a-khushal-rnp`) or, where the teacher has no equivalent, on
//! the nearest idiom in the rest of the retrieval pack — see `DESIGN.md`.

pub mod cache;
pub mod installer;
pub mod message;
pub mod npm_cli;
pub mod preview;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod runner;
pub mod semver;
pub mod shell;
pub mod tar_extract;
