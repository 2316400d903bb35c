use chrono::{DateTime, Local};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

pub type ExitCode = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Working-directory state shared across builtin invocations within one task.
pub struct Shell {
    pub cwd: PathBuf,
}

impl Shell {
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }
}

type Emit<'a> = dyn FnMut(Stream, &str) + 'a;

fn out(emit: &mut Emit, line: impl AsRef<str>) {
    emit(Stream::Stdout, line.as_ref());
}

fn err(emit: &mut Emit, line: impl AsRef<str>) {
    emit(Stream::Stderr, line.as_ref());
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn positional(args: &[String]) -> Vec<&String> {
    args.iter().filter(|a| !a.starts_with('-')).collect()
}

/// Excludes `node_modules` and `.git` from any directory walk, per spec.md §3/§4.F.
fn should_skip(name: &str) -> bool {
    name == "node_modules" || name == ".git"
}

pub fn run_builtin(shell: &mut Shell, cmd: &str, args: &[String], emit: &mut Emit) -> ExitCode {
    match cmd {
        "pwd" => {
            out(emit, format!("{}\n", shell.cwd.display()));
            0
        }
        "echo" => cmd_echo(args, emit),
        "ls" => cmd_ls(shell, args, emit),
        "cat" => cmd_cat(shell, args, emit),
        "mkdir" => cmd_mkdir(shell, args, emit),
        "rm" => cmd_rm(shell, args, emit),
        "rmdir" => cmd_rmdir(shell, args, emit),
        "touch" => cmd_touch(shell, args, emit),
        "cp" => cmd_cp(shell, args, emit),
        "mv" => cmd_mv(shell, args, emit),
        "which" => cmd_which(args, emit),
        "env" => cmd_env(emit),
        "whoami" => cmd_whoami(emit),
        "uname" => cmd_uname(args, emit),
        "date" => cmd_date(emit),
        "head" => cmd_head_tail(shell, args, emit, true),
        "tail" => cmd_head_tail(shell, args, emit, false),
        "wc" => cmd_wc(shell, args, emit),
        "find" => cmd_find(shell, args, emit),
        "dirname" => cmd_dirname(args, emit),
        "basename" => cmd_basename(args, emit),
        "realpath" => cmd_realpath(shell, args, emit),
        "clear" => {
            out(emit, "\x1b[2J\x1b[H");
            0
        }
        "true" => 0,
        "false" => 1,
        _ => {
            err(emit, format!("{cmd}: command not found\n"));
            127
        }
    }
}

fn cmd_echo(args: &[String], emit: &mut Emit) -> ExitCode {
    let no_newline = has_flag(args, "-n");
    let words: Vec<&String> = args.iter().filter(|a| *a != "-n").collect();
    let line = words
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if no_newline {
        out(emit, line);
    } else {
        out(emit, format!("{line}\n"));
    }
    0
}

fn format_mode(metadata: &fs::Metadata) -> String {
    let kind = if metadata.is_dir() { 'd' } else { '-' };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        let bits = |shift: u32| {
            let r = if mode & (0o4 << shift) != 0 { 'r' } else { '-' };
            let w = if mode & (0o2 << shift) != 0 { 'w' } else { '-' };
            let x = if mode & (0o1 << shift) != 0 { 'x' } else { '-' };
            format!("{r}{w}{x}")
        };
        format!("{kind}{}{}{}", bits(6), bits(3), bits(0))
    }
    #[cfg(not(unix))]
    {
        format!("{kind}rwxr-xr-x")
    }
}

fn format_mtime(metadata: &fs::Metadata) -> String {
    match metadata.modified() {
        Ok(time) => {
            let datetime: DateTime<Local> = time.into();
            datetime.format("%Y-%m-%d %H:%M").to_string()
        }
        Err(_) => "????-??-?? ??:??".to_string(),
    }
}

fn cmd_ls(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let show_all = has_flag(args, "-a");
    let long = has_flag(args, "-l");
    let one_per_line = has_flag(args, "-1") || long;

    let targets = positional(args);
    let dir = if targets.is_empty() {
        shell.cwd.clone()
    } else {
        shell.resolve(targets[0])
    };

    let mut entries = match fs::read_dir(&dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect::<Vec<_>>(),
        Err(e) => {
            err(emit, format!("ls: {}: {}\n", dir.display(), e));
            return 1;
        }
    };
    entries.sort_by_key(|e| e.file_name());

    let mut names = Vec::new();
    if show_all {
        names.push(".".to_string());
        names.push("..".to_string());
    }
    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !show_all && name.starts_with('.') {
            continue;
        }
        names.push(name);
    }

    if long {
        for name in &names {
            let path = dir.join(name);
            let Ok(metadata) = fs::metadata(&path) else { continue };
            out(
                emit,
                format!(
                    "{} {:>10} {} {}\n",
                    format_mode(&metadata),
                    metadata.len(),
                    format_mtime(&metadata),
                    name
                ),
            );
        }
    } else if one_per_line {
        for name in &names {
            out(emit, format!("{name}\n"));
        }
    } else {
        out(emit, format!("{}\n", names.join("  ")));
    }

    0
}

fn cmd_cat(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let number = has_flag(args, "-n");
    let files = positional(args);
    if files.is_empty() {
        err(emit, "cat: missing file operand\n");
        return 1;
    }

    let mut status = 0;
    for file in files {
        let path = shell.resolve(file);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                if number {
                    for (i, line) in contents.lines().enumerate() {
                        out(emit, format!("{:>6}\t{}\n", i + 1, line));
                    }
                } else {
                    out(emit, contents);
                }
            }
            Err(e) => {
                err(emit, format!("cat: {file}: {e}\n"));
                status = 1;
            }
        }
    }
    status
}

fn cmd_mkdir(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let parents = has_flag(args, "-p");
    let targets = positional(args);
    if targets.is_empty() {
        err(emit, "mkdir: missing operand\n");
        return 1;
    }
    let mut status = 0;
    for target in targets {
        let path = shell.resolve(target);
        let result = if parents { fs::create_dir_all(&path) } else { fs::create_dir(&path) };
        if let Err(e) = result {
            err(emit, format!("mkdir: {target}: {e}\n"));
            status = 1;
        }
    }
    status
}

fn cmd_rm(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let recursive = has_flag(args, "-r") || has_flag(args, "-rf") || has_flag(args, "-fr");
    let force = has_flag(args, "-f") || has_flag(args, "-rf") || has_flag(args, "-fr");
    let targets = positional(args);
    if targets.is_empty() {
        err(emit, "rm: missing operand\n");
        return 1;
    }
    let mut status = 0;
    for target in targets {
        let path = shell.resolve(target);
        let result = if path.is_dir() && recursive {
            fs::remove_dir_all(&path)
        } else if path.is_dir() {
            Err(std::io::Error::other(format!("{target}: is a directory")))
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result
            && !force
        {
            err(emit, format!("rm: {target}: {e}\n"));
            status = 1;
        }
    }
    status
}

fn cmd_rmdir(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    let mut status = 0;
    for target in targets {
        if let Err(e) = fs::remove_dir(shell.resolve(target)) {
            err(emit, format!("rmdir: {target}: {e}\n"));
            status = 1;
        }
    }
    status
}

fn cmd_touch(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    if targets.is_empty() {
        err(emit, "touch: missing operand\n");
        return 1;
    }
    let mut status = 0;
    for target in targets {
        let path = shell.resolve(target);
        if path.exists() {
            let now = std::time::SystemTime::now();
            if fs::File::open(&path).and_then(|f| f.set_modified(now)).is_err() {
                status = 1;
            }
        } else if let Err(e) = fs::File::create(&path) {
            err(emit, format!("touch: {target}: {e}\n"));
            status = 1;
        }
    }
    status
}

fn cmd_cp(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let recursive = has_flag(args, "-r");
    let targets = positional(args);
    if targets.len() < 2 {
        err(emit, "cp: missing file operand\n");
        return 1;
    }
    let dest = shell.resolve(targets[targets.len() - 1]);
    for src in &targets[..targets.len() - 1] {
        let src_path = shell.resolve(src);
        let dest_path = if dest.is_dir() {
            dest.join(src_path.file_name().unwrap_or_default())
        } else {
            dest.clone()
        };
        let result = if src_path.is_dir() {
            if recursive { copy_dir_recursive(&src_path, &dest_path) } else {
                Err(std::io::Error::other(format!("{src}: is a directory (not copied)")))
            }
        } else {
            fs::copy(&src_path, &dest_path).map(|_| ())
        };
        if let Err(e) = result {
            err(emit, format!("cp: {src}: {e}\n"));
            return 1;
        }
    }
    0
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

fn cmd_mv(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    if targets.len() < 2 {
        err(emit, "mv: missing file operand\n");
        return 1;
    }
    let dest = shell.resolve(targets[targets.len() - 1]);
    for src in &targets[..targets.len() - 1] {
        let src_path = shell.resolve(src);
        let dest_path = if dest.is_dir() {
            dest.join(src_path.file_name().unwrap_or_default())
        } else {
            dest.clone()
        };
        if let Err(e) = fs::rename(&src_path, &dest_path) {
            err(emit, format!("mv: {src}: {e}\n"));
            return 1;
        }
    }
    0
}

fn cmd_which(args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    if targets.is_empty() {
        return 1;
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    let mut status = 0;
    for target in targets {
        let found = std::env::split_paths(&path_var)
            .map(|dir| dir.join(target))
            .find(|candidate| candidate.is_file());
        match found {
            Some(p) => out(emit, format!("{}\n", p.display())),
            None => {
                status = 1;
            }
        }
    }
    status
}

fn cmd_env(emit: &mut Emit) -> ExitCode {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (k, v) in vars {
        out(emit, format!("{k}={v}\n"));
    }
    0
}

fn cmd_whoami(emit: &mut Emit) -> ExitCode {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    out(emit, format!("{name}\n"));
    0
}

fn cmd_uname(args: &[String], emit: &mut Emit) -> ExitCode {
    let all = has_flag(args, "-a");
    let machine_only = has_flag(args, "-m");
    let os = match std::env::consts::OS {
        "macos" => "Darwin",
        "windows" => "Windows_NT",
        other => {
            // POSIX uname reports "Linux" with that exact casing
            if other == "linux" { "Linux" } else { other }
        }
    };
    let arch = std::env::consts::ARCH;
    if machine_only {
        out(emit, format!("{arch}\n"));
    } else if all {
        out(emit, format!("{os} devcore 1.0 {os} {arch}\n"));
    } else {
        out(emit, format!("{os}\n"));
    }
    0
}

fn cmd_date(emit: &mut Emit) -> ExitCode {
    let now: DateTime<Local> = Local::now();
    out(emit, format!("{}\n", now.format("%a %b %e %H:%M:%S %Z %Y")));
    0
}

fn parse_count(args: &[String]) -> usize {
    for (i, a) in args.iter().enumerate() {
        if a == "-n"
            && let Some(n) = args.get(i + 1)
            && let Ok(n) = n.parse::<usize>()
        {
            return n;
        }
        if let Some(rest) = a.strip_prefix("-n")
            && let Ok(n) = rest.parse::<usize>()
        {
            return n;
        }
    }
    10
}

fn cmd_head_tail(shell: &mut Shell, args: &[String], emit: &mut Emit, is_head: bool) -> ExitCode {
    let count = parse_count(args);
    let files = positional(args)
        .into_iter()
        .filter(|a| a.parse::<usize>().is_err())
        .collect::<Vec<_>>();
    if files.is_empty() {
        err(emit, "missing file operand\n");
        return 1;
    }
    let mut status = 0;
    for file in files {
        let path = shell.resolve(file);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let lines: Vec<&str> = contents.lines().collect();
                let selected: Vec<&str> = if is_head {
                    lines.into_iter().take(count).collect()
                } else {
                    let start = lines.len().saturating_sub(count);
                    lines[start..].to_vec()
                };
                for line in selected {
                    out(emit, format!("{line}\n"));
                }
            }
            Err(e) => {
                err(emit, format!("{file}: {e}\n"));
                status = 1;
            }
        }
    }
    status
}

fn cmd_wc(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let files = positional(args);
    if files.is_empty() {
        err(emit, "wc: missing file operand\n");
        return 1;
    }
    let mut status = 0;
    for file in files {
        let path = shell.resolve(file);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let lines = contents.lines().count();
                let words = contents.split_whitespace().count();
                let bytes = contents.len();
                out(emit, format!("{lines:>7} {words:>7} {bytes:>7} {file}\n"));
            }
            Err(e) => {
                err(emit, format!("wc: {file}: {e}\n"));
                status = 1;
            }
        }
    }
    status
}

/// Translates a shell glob into an anchored regex: `*` -> `.*`, `?` -> `.`, all
/// other regex metacharacters escaped, per spec.md §4.F.
fn glob_to_regex(glob: &str) -> Regex {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

fn walk(dir: &Path, out_paths: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if should_skip(&name) {
            continue;
        }
        let path = entry.path();
        out_paths.push(path.clone());
        if path.is_dir() {
            walk(&path, out_paths);
        }
    }
}

fn cmd_find(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    let root = if targets.is_empty() {
        shell.cwd.clone()
    } else {
        shell.resolve(targets[0])
    };

    let mut name_filter: Option<Regex> = None;
    let mut type_filter: Option<char> = None;
    let mut iter = args.iter().peekable();
    while let Some(a) = iter.next() {
        match a.as_str() {
            "-name" => {
                if let Some(pattern) = iter.next() {
                    name_filter = Some(glob_to_regex(pattern));
                }
            }
            "-type" => {
                if let Some(t) = iter.next() {
                    type_filter = t.chars().next();
                }
            }
            _ => {}
        }
    }

    let mut paths = Vec::new();
    walk(&root, &mut paths);

    for path in paths {
        if let Some(re) = &name_filter {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if !re.is_match(&name) {
                continue;
            }
        }
        if let Some(t) = type_filter {
            let matches = match t {
                'f' => path.is_file(),
                'd' => path.is_dir(),
                _ => true,
            };
            if !matches {
                continue;
            }
        }
        out(emit, format!("{}\n", path.display()));
    }
    0
}

fn cmd_dirname(args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    let Some(target) = targets.first() else {
        err(emit, "dirname: missing operand\n");
        return 1;
    };
    let parent = Path::new(target).parent().unwrap_or_else(|| Path::new("."));
    let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    out(emit, format!("{}\n", parent.display()));
    0
}

fn cmd_basename(args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    let Some(target) = targets.first() else {
        err(emit, "basename: missing operand\n");
        return 1;
    };
    let mut name = Path::new(target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_string());
    if let Some(suffix) = targets.get(1)
        && let Some(stripped) = name.strip_suffix(suffix.as_str())
    {
        name = stripped.to_string();
    }
    out(emit, format!("{name}\n"));
    0
}

fn cmd_realpath(shell: &mut Shell, args: &[String], emit: &mut Emit) -> ExitCode {
    let targets = positional(args);
    let Some(target) = targets.first() else {
        err(emit, "realpath: missing operand\n");
        return 1;
    };
    match fs::canonicalize(shell.resolve(target)) {
        Ok(path) => {
            out(emit, format!("{}\n", path.display()));
            0
        }
        Err(e) => {
            err(emit, format!("realpath: {target}: {e}\n"));
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collect(shell: &mut Shell, cmd: &str, args: &[String]) -> (String, String, ExitCode) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let code = {
            let mut emit = |stream: Stream, text: &str| match stream {
                Stream::Stdout => stdout.push_str(text),
                Stream::Stderr => stderr.push_str(text),
            };
            run_builtin(shell, cmd, args, &mut emit)
        };
        (stdout, stderr, code)
    }

    #[test]
    fn pwd_reports_cwd() {
        let dir = tempdir().unwrap();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let (stdout, _, code) = collect(&mut shell, "pwd", &[]);
        assert_eq!(code, 0);
        assert!(stdout.trim().ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn echo_n_suppresses_newline() {
        let dir = tempdir().unwrap();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let (stdout, _, _) = collect(&mut shell, "echo", &["-n".to_string(), "hi".to_string()]);
        assert_eq!(stdout, "hi");
    }

    #[test]
    fn mkdir_and_ls_roundtrip() {
        let dir = tempdir().unwrap();
        let mut shell = Shell::new(dir.path().to_path_buf());
        collect(&mut shell, "mkdir", &["sub".to_string()]);
        let (stdout, _, code) = collect(&mut shell, "ls", &["-1".to_string()]);
        assert_eq!(code, 0);
        assert!(stdout.contains("sub"));
    }

    #[test]
    fn cat_missing_file_is_usage_error() {
        let dir = tempdir().unwrap();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let (_, stderr, code) = collect(&mut shell, "cat", &["missing.txt".to_string()]);
        assert_eq!(code, 1);
        assert!(stderr.contains("missing.txt"));
    }

    #[test]
    fn unknown_command_is_127() {
        let dir = tempdir().unwrap();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let (_, _, code) = collect(&mut shell, "frobnicate", &[]);
        assert_eq!(code, 127);
    }

    #[test]
    fn glob_translation_escapes_metacharacters() {
        let re = glob_to_regex("*.test.js");
        assert!(re.is_match("foo.test.js"));
        assert!(!re.is_match("foo.testxjs"));
    }

    #[test]
    fn find_excludes_node_modules() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(dir.path().join("App.js"), "x").unwrap();

        let mut shell = Shell::new(dir.path().to_path_buf());
        let (stdout, _, _) = collect(&mut shell, "find", &[".".to_string()]);
        assert!(stdout.contains("App.js"));
        assert!(!stdout.contains("node_modules"));
    }
}
