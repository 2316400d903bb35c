//! npm-lite subcommand dispatch — the glue spec.md §6 describes as part of the
//! `exec` CLI surface ("npm subcommands: install|i|ci|add ..."). Generalizes
//! the teacher's `main.rs` Commands enum and `commands::install` handlers into
//! a single dispatcher over the new [`crate::resolver`]/[`crate::installer`]
//! modules, since the teacher's package.json shape and lockfile schema differ
//! from spec.md §3's.

use crate::installer;
use crate::registry::RegistryClient;
use crate::resolver::Resolver;
use crate::shell::builtins::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const DEVCORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PackageJson {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "devDependencies", default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

fn default_name() -> String {
    "project".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn read_package_json(project_dir: &Path) -> PackageJson {
    fs::read_to_string(project_dir.join("package.json"))
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

fn write_package_json(project_dir: &Path, pkg: &PackageJson) -> Result<(), Box<dyn Error + Send + Sync>> {
    let serialized = serde_json::to_string_pretty(pkg)?;
    fs::write(project_dir.join("package.json"), serialized)?;
    Ok(())
}

fn all_dependencies(pkg: &PackageJson) -> std::collections::HashMap<String, String> {
    let mut merged: std::collections::HashMap<String, String> = pkg.dependencies.clone().into_iter().collect();
    merged.extend(pkg.dev_dependencies.clone());
    merged
}

async fn run_install(
    project_dir: &Path,
    extra_packages: &[String],
    mut emit: impl FnMut(Stream, &str),
    cancel: CancellationToken,
) -> i32 {
    let mut pkg = read_package_json(project_dir);

    for spec in extra_packages {
        let (name, range) = match spec.split_once('@') {
            Some((n, r)) if !n.is_empty() => (n.to_string(), r.to_string()),
            _ => (spec.clone(), "latest".to_string()),
        };
        pkg.dependencies.insert(name, range);
    }
    if !extra_packages.is_empty() {
        if let Err(e) = write_package_json(project_dir, &pkg) {
            emit(Stream::Stderr, &format!("failed to update package.json: {e}\n"));
            return 1;
        }
    }

    let dependencies = all_dependencies(&pkg);
    let mut resolver = Resolver::new(RegistryClient::new());
    let resolved = match resolver.resolve(&dependencies).await {
        Ok(r) => r,
        Err(e) => {
            emit(Stream::Stderr, &format!("resolve failed: {e}\n"));
            return 1;
        }
    };
    for warning in &resolver.warnings {
        emit(Stream::Stderr, &format!("warn: {warning}\n"));
    }

    match installer::install_resolved(&resolved, project_dir, cancel).await {
        Ok(count) => {
            emit(Stream::Stdout, &format!("installed {count} package(s)\n"));
        }
        Err(e) => {
            emit(Stream::Stderr, &format!("install failed: {e}\n"));
            return 1;
        }
    }

    if let Err(e) = installer::write_lockfile(&resolved, project_dir) {
        emit(Stream::Stderr, &format!("failed to write lockfile: {e}\n"));
        return 1;
    }

    0
}

async fn run_uninstall(project_dir: &Path, packages: &[String], mut emit: impl FnMut(Stream, &str)) -> i32 {
    let mut pkg = read_package_json(project_dir);
    for name in packages {
        pkg.dependencies.remove(name);
        pkg.dev_dependencies.remove(name);
        let dest = installer_package_dest(project_dir, name);
        if dest.is_dir() && fs::remove_dir_all(&dest).is_err() {
            emit(Stream::Stderr, &format!("failed to remove {name}\n"));
        }
    }
    if let Err(e) = write_package_json(project_dir, &pkg) {
        emit(Stream::Stderr, &format!("failed to update package.json: {e}\n"));
        return 1;
    }
    0
}

fn installer_package_dest(project_dir: &Path, name: &str) -> std::path::PathBuf {
    let node_modules = project_dir.join("node_modules");
    if let Some((scope, pkg)) = name.split_once('/') {
        node_modules.join(scope).join(pkg)
    } else {
        node_modules.join(name)
    }
}

fn run_list(project_dir: &Path, mut emit: impl FnMut(Stream, &str)) -> i32 {
    let node_modules = project_dir.join("node_modules");
    let Ok(entries) = fs::read_dir(&node_modules) else {
        emit(Stream::Stdout, "(empty)\n");
        return 0;
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n != ".bin")
        .collect();
    names.sort();
    for name in names {
        let version = fs::read_to_string(node_modules.join(&name).join("package.json"))
            .ok()
            .and_then(|data| serde_json::from_str::<serde_json::Value>(&data).ok())
            .and_then(|json| json.get("version").and_then(|v| v.as_str()).map(String::from))
            .unwrap_or_else(|| "unknown".to_string());
        emit(Stream::Stdout, &format!("{name}@{version}\n"));
    }
    0
}

fn run_init(project_dir: &Path, mut emit: impl FnMut(Stream, &str)) -> i32 {
    let path = project_dir.join("package.json");
    if path.exists() {
        emit(Stream::Stderr, "package.json already exists\n");
        return 1;
    }
    let name = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();
    let pkg = PackageJson { name, version: "1.0.0".to_string(), ..Default::default() };
    match write_package_json(project_dir, &pkg) {
        Ok(()) => {
            emit(Stream::Stdout, "wrote package.json\n");
            0
        }
        Err(e) => {
            emit(Stream::Stderr, &format!("{e}\n"));
            1
        }
    }
}

fn naive_tokenize(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

/// Dispatches a single npm-family invocation; `yarn`/`pnpm`/`bun` alias here.
pub async fn dispatch(
    args: &[String],
    project_dir: &Path,
    mut emit: impl FnMut(Stream, &str) + Clone + Send + 'static,
    cancel: CancellationToken,
) -> i32 {
    let Some(sub) = args.first().cloned() else {
        emit(Stream::Stderr, "usage: npm <command>\n");
        return 1;
    };

    match sub.as_str() {
        "-v" | "--version" => {
            emit(Stream::Stdout, &format!("{DEVCORE_VERSION}\n"));
            0
        }
        "install" | "i" | "ci" | "add" => run_install(project_dir, &args[1..], emit, cancel).await,
        "uninstall" | "remove" | "rm" | "un" => run_uninstall(project_dir, &args[1..], emit).await,
        "ls" | "list" => run_list(project_dir, emit),
        "init" => run_init(project_dir, emit),
        "run" | "run-script" => {
            let Some(name) = args.get(1) else {
                emit(Stream::Stderr, "usage: npm run <script>\n");
                return 1;
            };
            run_script(project_dir, name, &args[2..], emit, cancel).await
        }
        "start" => run_script_or_preview(project_dir, "start", &args[1..], emit, cancel).await,
        "test" => {
            let pkg = read_package_json(project_dir);
            if pkg.scripts.contains_key("test") {
                run_script(project_dir, "test", &args[1..], emit, cancel).await
            } else {
                emit(Stream::Stderr, "Error: no test specified\n");
                1
            }
        }
        "help" => {
            emit(
                Stream::Stdout,
                "usage: npm <install|ci|add|uninstall|run|start|test|init|ls|help> [args]\n",
            );
            0
        }
        other => {
            emit(Stream::Stderr, &format!("npm: unknown command '{other}'\n"));
            1
        }
    }
}

async fn run_script(
    project_dir: &Path,
    name: &str,
    extra_args: &[String],
    emit: impl FnMut(Stream, &str) + Clone + Send + 'static,
    cancel: CancellationToken,
) -> i32 {
    let pkg = read_package_json(project_dir);
    let Some(command_line) = pkg.scripts.get(name) else {
        let mut emit = emit;
        emit(Stream::Stderr, &format!("missing script: {name}\n"));
        return 1;
    };

    let mut tokens = naive_tokenize(command_line);
    tokens.extend(extra_args.iter().cloned());
    let Some(head) = tokens.first().cloned() else {
        return 0;
    };

    let mut emit = emit;
    match crate::router::dispatch_cli(&head, &tokens[1..], project_dir, emit.clone(), cancel).await {
        Ok(code) => code,
        Err(e) => {
            emit(Stream::Stderr, &format!("script '{name}' failed: {e}\n"));
            1
        }
    }
}

async fn run_script_or_preview(
    project_dir: &Path,
    name: &str,
    extra_args: &[String],
    mut emit: impl FnMut(Stream, &str) + Clone + Send + 'static,
    cancel: CancellationToken,
) -> i32 {
    let pkg = read_package_json(project_dir);
    if pkg.scripts.contains_key(name) {
        return run_script(project_dir, name, extra_args, emit, cancel).await;
    }
    for candidate in ["server.js", "index.js"] {
        if project_dir.join(candidate).is_file() {
            let mut args = vec![candidate.to_string()];
            args.extend(extra_args.iter().cloned());
            return crate::runner::run_file(&args, project_dir, emit, cancel, true)
                .await
                .unwrap_or(1);
        }
    }

    match crate::preview::PreviewServer::start(project_dir.to_path_buf(), cancel.clone()) {
        Ok(server) => {
            emit(Stream::Stdout, &format!("preview server listening on http://127.0.0.1:{}\n", server.port));
            while !cancel.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            130
        }
        Err(e) => {
            emit(Stream::Stderr, &format!("failed to start preview server: {e}\n"));
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_missing_package_json_as_default() {
        let dir = tempdir().unwrap();
        let pkg = read_package_json(dir.path());
        assert_eq!(pkg.name, "project");
    }

    #[test]
    fn naive_tokenize_splits_on_whitespace() {
        assert_eq!(naive_tokenize("node build.js --watch"), vec!["node", "build.js", "--watch"]);
    }

    #[test]
    fn init_rejects_existing_package_json() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        let mut out = String::new();
        let code = run_init(dir.path(), |_, text: &str| out.push_str(text));
        assert_eq!(code, 1);
    }
}
