//! Command router / supervisor (component I). New relative to the teacher
//! (a one-shot CLI has no notion of concurrent named tasks); grounded on
//! spec.md §4.I/§9's guidance: a task type owning its cancellation token and
//! output sink, stored in a `map<id → task>`. Since the message loop drives
//! this from a single async task per connection, the map only needs a plain
//! `HashMap` behind `&mut self`, not a mutex.

use crate::npm_cli;
use crate::runner;
use crate::shell::{self, Shell};
use crate::shell::builtins::Stream;
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Outbound event produced by a running task; the message loop (component J)
/// turns these into wire frames.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Stdout { id: u64, data: String },
    Stderr { id: u64, data: String },
    Exit { id: u64, code: i32 },
    Killed { id: u64 },
    /// The handler itself raised rather than producing an exit code — spec.md
    /// §7's `Internal` taxonomy (e.g. the script runner failing to build a
    /// context), distinct from a script merely exiting non-zero.
    Error { id: u64, message: String },
}

struct TaskHandle {
    cancel: CancellationToken,
}

/// Single-threaded cooperative supervisor: one `Supervisor` per message-loop
/// connection, holding every live task's cancellation token (spec.md §4.I).
pub struct Supervisor {
    tasks: HashMap<u64, TaskHandle>,
    events: UnboundedSender<TaskEvent>,
}

impl Supervisor {
    pub fn new(events: UnboundedSender<TaskEvent>) -> Self {
        Self { tasks: HashMap::new(), events }
    }

    /// Allocates a task record, builds its emit sink, and spawns the dispatch.
    /// Ordering: stdout/stderr frames for `id` are delivered in emission
    /// order because they all funnel through the one `events` sender.
    pub fn exec(&mut self, id: u64, command: String, args: Vec<String>, cwd: PathBuf) {
        let cancel = CancellationToken::new();
        self.tasks.insert(id, TaskHandle { cancel: cancel.clone() });

        let _ = std::fs::create_dir_all(&cwd);

        let events = self.events.clone();
        let stdout_events = events.clone();
        let stderr_events = events.clone();
        let emit = move |stream: Stream, text: &str| {
            let event = match stream {
                Stream::Stdout => TaskEvent::Stdout { id, data: text.to_string() },
                Stream::Stderr => TaskEvent::Stderr { id, data: text.to_string() },
            };
            let sink = match stream {
                Stream::Stdout => &stdout_events,
                Stream::Stderr => &stderr_events,
            };
            let _ = sink.send(event);
        };

        tokio::spawn(async move {
            let result = dispatch_cli(&command, &args, &cwd, emit, cancel.clone()).await;
            let final_event = if cancel.is_cancelled() {
                TaskEvent::Killed { id }
            } else {
                match result {
                    Ok(code) => TaskEvent::Exit { id, code },
                    Err(e) => TaskEvent::Error { id, message: e.to_string() },
                }
            };
            let _ = events.send(final_event);
        });
    }

    /// Transitions a task's cancellation token; the task's own dispatch loop
    /// observes it at the next suspension point (spec.md §5).
    pub fn kill(&mut self, id: u64) -> bool {
        if let Some(task) = self.tasks.remove(&id) {
            task.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        for task in self.tasks.values() {
            task.cancel.cancel();
        }
        self.tasks.clear();
    }
}

/// Dispatches one command line to the correct subsystem: shell builtins,
/// the script runner, or the npm-family CLI. Shared by the supervisor's
/// `exec` handling and `npm run <script>`'s re-dispatch of its command line.
///
/// Returns `Err` only for a genuine handler failure (spec.md §7's `Internal`
/// taxonomy), never for a command that merely exits non-zero — that's `Ok(code)`.
pub async fn dispatch_cli(
    command: &str,
    args: &[String],
    cwd: &Path,
    mut emit: impl FnMut(Stream, &str) + Clone + Send + 'static,
    cancel: CancellationToken,
) -> Result<i32, Box<dyn Error + Send + Sync>> {
    match command {
        "node" => {
            if args.first().map(|a| a.as_str()) == Some("-v") {
                emit(Stream::Stdout, "v18.0.0-devcore\n");
                return Ok(0);
            }
            runner::run_file(args, cwd, emit, cancel, false).await
        }
        "npx" => {
            let Some(bin) = args.first() else {
                emit(Stream::Stderr, "usage: npx <bin> [args]\n");
                return Ok(1);
            };
            runner::run_bin(bin, &args[1..], cwd, emit, cancel, false).await
        }
        "npm" | "yarn" | "pnpm" | "bun" => Ok(npm_cli::dispatch(args, cwd, emit, cancel).await),
        other => {
            let mut shell = Shell::new(cwd.to_path_buf());
            let mut adapter = move |stream: Stream, text: &str| emit(stream, text);
            Ok(shell::run_builtin(&mut shell, other, args, &mut adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[tokio::test]
    async fn exec_reports_stdout_then_exit() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        supervisor.exec(
            1,
            "node".to_string(),
            vec!["-e".to_string(), "console.log(2+2)".to_string()],
            dir.path().to_path_buf(),
        );

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let is_terminal = matches!(event, TaskEvent::Exit { .. } | TaskEvent::Killed { .. });
            events.push(event);
            if is_terminal {
                break;
            }
        }

        assert!(matches!(&events[0], TaskEvent::Stdout { id: 1, data } if data == "4\n"));
        assert!(matches!(events.last().unwrap(), TaskEvent::Exit { id: 1, code: 0 }));
    }

    #[tokio::test]
    async fn exec_of_malformed_bin_stub_reports_error_event() {
        let dir = tempdir().unwrap();
        let bin_dir = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join("mytool"), "#!/usr/bin/env node\n").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        supervisor.exec(1, "npx".to_string(), vec!["mytool".to_string()], dir.path().to_path_buf());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let is_terminal = matches!(event, TaskEvent::Exit { .. } | TaskEvent::Killed { .. } | TaskEvent::Error { .. });
            events.push(event);
            if is_terminal {
                break;
            }
        }

        assert!(matches!(events.last().unwrap(), TaskEvent::Error { id: 1, .. }));
    }

    #[tokio::test]
    async fn kill_of_unknown_task_returns_false() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut supervisor: Supervisor = Supervisor::new(tx);
        assert!(!supervisor.kill(999));
    }

    #[tokio::test]
    async fn kill_of_registered_task_returns_true() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let output = Arc::new(Mutex::new(Vec::new()));

        supervisor.exec(7, "node".to_string(), vec!["-e".to_string(), "1+1".to_string()], dir.path().to_path_buf());
        assert!(supervisor.kill(7));

        while let Some(event) = rx.recv().await {
            let terminal = matches!(event, TaskEvent::Exit { .. } | TaskEvent::Killed { .. });
            output.lock().unwrap().push(event);
            if terminal {
                break;
            }
        }
    }
}
