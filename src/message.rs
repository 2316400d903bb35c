//! Message loop (component J): line-delimited JSON over stdio, the channel
//! the UI drives the whole core through (spec.md §4.J/§6). New relative to
//! the teacher (a one-shot CLI); grounded on spec.md §9's guidance to keep
//! per-task output funneled through a single sink — here the channel
//! carrying [`crate::router::TaskEvent`] values back to one writer loop.

use crate::router::{Supervisor, TaskEvent};
use serde_json::{Value, json};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const DEVCORE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn write_frame(out: &mut impl Write, value: Value) {
    if let Ok(line) = serde_json::to_string(&value) {
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

fn task_event_frame(event: TaskEvent) -> Value {
    match event {
        TaskEvent::Stdout { id, data } => json!({"type":"stdout","id":id,"data":data}),
        TaskEvent::Stderr { id, data } => json!({"type":"stderr","id":id,"data":data}),
        TaskEvent::Exit { id, code } => json!({"type":"exit","id":id,"code":code}),
        TaskEvent::Killed { id } => json!({"type":"killed","id":id}),
        TaskEvent::Error { id, message } => json!({"type":"error","id":id,"message":message}),
    }
}

fn fs_op_frame(value: &Value, datadir: &Path, projects_dir: &Path) -> Value {
    let msg_type = value.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    let resolve = |raw: &str| -> PathBuf {
        let trimmed = raw.trim_start_matches('/');
        projects_dir.join(trimmed)
    };

    match msg_type {
        "writeFile" => {
            let path = value.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            let content = value.get("content").and_then(|v| v.as_str()).unwrap_or_default();
            let full = resolve(path);
            let result = full
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::write(&full, content));
            match result {
                Ok(()) => json!({"type":"done","id":id}),
                Err(e) => json!({"type":"error","id":id,"message":e.to_string()}),
            }
        }
        "readFile" => {
            let path = value.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            match fs::read_to_string(resolve(path)) {
                Ok(content) => json!({"type":"result","id":id,"content":content}),
                Err(e) => json!({"type":"error","id":id,"message":e.to_string()}),
            }
        }
        "mkdir" => {
            let path = value.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            match fs::create_dir_all(resolve(path)) {
                Ok(()) => json!({"type":"done","id":id}),
                Err(e) => json!({"type":"error","id":id,"message":e.to_string()}),
            }
        }
        "readDir" => {
            let path = value.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            match fs::read_dir(resolve(path)) {
                Ok(entries) => {
                    let list: Vec<Value> = entries
                        .filter_map(|e| e.ok())
                        .map(|e| {
                            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                            json!({"name": e.file_name().to_string_lossy(), "isDirectory": is_dir})
                        })
                        .collect();
                    json!({"type":"result","id":id,"entries":list})
                }
                Err(e) => json!({"type":"error","id":id,"message":e.to_string()}),
            }
        }
        "getInfo" => json!({
            "type": "info",
            "id": id,
            "nodeVersion": DEVCORE_VERSION,
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "datadir": datadir.display().to_string(),
            "projectsDir": projects_dir.display().to_string(),
            "execPath": std::env::current_exe().map(|p| p.display().to_string()).unwrap_or_default(),
        }),
        "ping" => json!({"type":"pong","nodeVersion":DEVCORE_VERSION,"platform":std::env::consts::OS}),
        other => json!({"type":"error","id":id,"message": format!("unknown message type '{other}'")}),
    }
}

fn handle_inbound_line(
    line: &str,
    supervisor: &mut Supervisor,
    datadir: &Path,
    projects_dir: &Path,
    out: &mut impl Write,
) {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        write_frame(out, json!({"type":"error","message":"invalid JSON frame"}));
        return;
    };
    let msg_type = value.get("type").and_then(|v| v.as_str()).unwrap_or_default();

    match msg_type {
        "exec" => {
            let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                write_frame(out, json!({"type":"error","message":"exec requires id"}));
                return;
            };
            let command = value.get("command").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let args: Vec<String> = value
                .get("args")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let cwd = value
                .get("cwd")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| projects_dir.to_path_buf());
            supervisor.exec(id, command, args, cwd);
        }
        "kill" => {
            let process_id = value.get("processId").and_then(|v| v.as_u64());
            match process_id {
                Some(pid) if supervisor.kill(pid) => {
                    write_frame(out, json!({"type":"killed","id":pid}));
                }
                Some(pid) => write_frame(out, json!({"type":"error","id":pid,"message":"no such task"})),
                None => write_frame(out, json!({"type":"error","message":"kill requires processId"})),
            }
        }
        _ => write_frame(out, fs_op_frame(&value, datadir, projects_dir)),
    }
}

/// Drives the message loop until stdin closes. A blocking reader thread
/// forwards raw lines to this async task over a channel, so stdin reads
/// never block the supervisor's event processing.
pub async fn run_message_loop(datadir: PathBuf, projects_dir: PathBuf) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_frame(&mut out, json!({"type":"ready","nodeVersion":DEVCORE_VERSION}));

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) => {
                    if line_tx.send(text).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TaskEvent>();
    let mut supervisor = Supervisor::new(event_tx);

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => {
                match maybe_line {
                    Some(line) if !line.trim().is_empty() => {
                        handle_inbound_line(&line, &mut supervisor, &datadir, &projects_dir, &mut out);
                    }
                    Some(_) => {}
                    None => {
                        supervisor.clear();
                        return Ok(());
                    }
                }
            }
            Some(event) = event_rx.recv() => {
                write_frame(&mut out, task_event_frame(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn error_task_event_becomes_error_frame() {
        let frame = task_event_frame(TaskEvent::Error { id: 9, message: "boom".to_string() });
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["message"], "boom");
    }

    #[tokio::test]
    async fn write_then_read_file_round_trips() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let mut buf = Vec::new();

        let write_line = json!({"type":"writeFile","id":1,"path":"/a.txt","content":"hi"}).to_string();
        handle_inbound_line(&write_line, &mut supervisor, dir.path(), dir.path(), &mut buf);

        let read_line = json!({"type":"readFile","id":2,"path":"/a.txt"}).to_string();
        handle_inbound_line(&read_line, &mut supervisor, dir.path(), dir.path(), &mut buf);

        let output = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["type"], "done");
        assert_eq!(second["content"], "hi");
    }

    #[tokio::test]
    async fn read_dir_reports_entries() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("file.txt"), "x").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let mut buf = Vec::new();
        let line = json!({"type":"readDir","id":1,"path":"/"}).to_string();
        handle_inbound_line(&line, &mut supervisor, dir.path(), dir.path(), &mut buf);

        let output: Value = serde_json::from_str(String::from_utf8(buf).unwrap().trim()).unwrap();
        let entries = output["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn kill_of_unknown_process_is_error() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let mut buf = Vec::new();
        let line = json!({"type":"kill","processId":42}).to_string();
        handle_inbound_line(&line, &mut supervisor, dir.path(), dir.path(), &mut buf);

        let output: Value = serde_json::from_str(String::from_utf8(buf).unwrap().trim()).unwrap();
        assert_eq!(output["type"], "error");
    }
}
