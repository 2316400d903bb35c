//! Preview bundle construction (component H). Scans the project tree,
//! rewrites each code file with [`crate::preview::rewrite::rewrite_module`],
//! and assembles the self-contained HTML document the dev-server endpoints
//! serve. Grounded on the teacher's directory-walk discipline in
//! `build_nested_node_modules` (skip dirs, sorted deterministic traversal)
//! generalized here to project source files instead of `node_modules`.

use crate::preview::rewrite::rewrite_module;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

const CODE_EXTENSIONS: [&str; 4] = ["js", "jsx", "ts", "tsx"];

struct ScanResult {
    modules: BTreeMap<String, String>,
    css: String,
}

fn normalized_path(project_dir: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(project_dir).unwrap_or(file);
    let mut normalized = rel.to_string_lossy().replace('\\', "/");
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

fn scan_dir(dir: &Path, project_dir: &Path, result: &mut ScanResult) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    entries.sort();

    for path in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }

        if path.is_dir() {
            scan_dir(&path, project_dir, result)?;
            continue;
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if ext == "css" {
            let contents = fs::read_to_string(&path).unwrap_or_default();
            result.css.push_str(&contents);
            result.css.push('\n');
        } else if ext == "json" {
            let contents = fs::read_to_string(&path).unwrap_or_else(|_| "{}".to_string());
            let key = normalized_path(project_dir, &path);
            result.modules.insert(key, format!("module.exports = {contents};"));
        } else if CODE_EXTENSIONS.contains(&ext) {
            let contents = fs::read_to_string(&path).unwrap_or_default();
            let key = normalized_path(project_dir, &path);
            result.modules.insert(key, rewrite_module(&contents));
        }
    }

    Ok(())
}

/// Selects the entry module by the priority spec.md §3/§4.H describe:
/// `/index.*` first, then `/App.*`, then the first registered file.
fn select_entry(modules: &BTreeMap<String, String>) -> Option<String> {
    for ext in CODE_EXTENSIONS {
        let candidate = format!("/index.{ext}");
        if modules.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    for ext in CODE_EXTENSIONS {
        let candidate = format!("/App.{ext}");
        if modules.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    modules.keys().next().cloned()
}

fn module_table_js(modules: &BTreeMap<String, String>) -> String {
    let mut out = String::from("{\n");
    for (path, source) in modules {
        out.push_str(&format!(
            "{}: function(module, exports, require) {{\n{}\n}},\n",
            serde_json::to_string(path).unwrap_or_default(),
            source
        ));
    }
    out.push('}');
    out
}

fn entry_script_js(entry: &str) -> String {
    if entry.starts_with("/index.") {
        format!("__devcoreRequire({});", serde_json::to_string(entry).unwrap_or_default())
    } else {
        format!(
            "var __entryExports = __devcoreRequire({});\nvar __App = (__entryExports && __entryExports.default !== undefined) ? __entryExports.default : __entryExports;\nvar __root = ReactDOM.createRoot(document.getElementById('root'));\n__root.render(React.createElement(__App, null));",
            serde_json::to_string(entry).unwrap_or_default()
        )
    }
}

const CLIENT_LOADER_TEMPLATE: &str = r#"
<script>
(function() {
  var MODULES = __DEVCORE_MODULES__;
  var cache = {};

  function interopDefault(m) {
    return m && Object.prototype.hasOwnProperty.call(m, 'default') ? m.default : m;
  }
  window.__devcoreInteropDefault = interopDefault;

  var BUILTINS = {
    'react': window.React,
    'react-dom': window.ReactDOM,
    'react/jsx-runtime': {
      jsx: function(type, props, key) { return React.createElement(type, Object.assign({}, props, key !== undefined ? {key: key} : {})); },
      jsxs: function(type, props, key) { return React.createElement(type, Object.assign({}, props, key !== undefined ? {key: key} : {})); },
      Fragment: React.Fragment,
    },
  };

  function normalize(base, specifier) {
    if (specifier[0] !== '.') return specifier;
    var baseParts = base.split('/').slice(0, -1);
    var parts = specifier.split('/');
    for (var i = 0; i < parts.length; i++) {
      if (parts[i] === '.' || parts[i] === '') continue;
      if (parts[i] === '..') baseParts.pop();
      else baseParts.push(parts[i]);
    }
    return '/' + baseParts.join('/');
  }

  function resolve(from, specifier) {
    if (BUILTINS[specifier]) return specifier;
    var path = normalize(from, specifier);
    var candidates = [path, path + '.js', path + '.jsx', path + '.ts', path + '.tsx', path + '.json',
                       path + '/index.js', path + '/index.jsx', path + '/index.ts', path + '/index.tsx'];
    for (var i = 0; i < candidates.length; i++) {
      if (MODULES[candidates[i]]) return candidates[i];
    }
    return null;
  }

  function devcoreRequireFrom(from) {
    return function(specifier) {
      if (BUILTINS[specifier]) return BUILTINS[specifier];
      var resolved = resolve(from, specifier);
      if (!resolved) return {};
      if (resolved.endsWith('.css')) return {};
      if (cache[resolved]) return cache[resolved].exports;

      var entry = { exports: {} };
      cache[resolved] = entry;
      try {
        MODULES[resolved](entry, entry.exports, devcoreRequireFrom(resolved));
      } catch (err) {
        window.parent.postMessage({ type: 'preview-error', message: String(err && err.message || err), stack: String(err && err.stack || '') }, '*');
      }
      return entry.exports;
    };
  }

  window.__devcoreRequire = devcoreRequireFrom('/');
  window.createElement = React.createElement;

  try {
    __DEVCORE_ENTRY_SCRIPT__
  } catch (err) {
    window.parent.postMessage({ type: 'preview-error', message: String(err && err.message || err), stack: String(err && err.stack || '') }, '*');
  }
})();
</script>
"#;

/// Builds the self-contained HTML document for the current project tree.
/// Deterministic: identical file contents always yield byte-identical HTML
/// (sorted directory walk, `BTreeMap` module table).
pub fn build_bundle(project_dir: &Path) -> Result<String, Box<dyn Error + Send + Sync>> {
    let mut result = ScanResult { modules: BTreeMap::new(), css: String::new() };
    scan_dir(project_dir, project_dir, &mut result)?;

    let entry = select_entry(&result.modules);
    let entry_script = entry.as_deref().map(entry_script_js).unwrap_or_default();
    let module_table = module_table_js(&result.modules);

    let loader = CLIENT_LOADER_TEMPLATE
        .replace("__DEVCORE_MODULES__", &module_table)
        .replace("__DEVCORE_ENTRY_SCRIPT__", &entry_script);

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n{}\n</style>\n<script src=\"https://unpkg.com/react@18/umd/react.development.js\"></script>\n<script src=\"https://unpkg.com/react-dom@18/umd/react-dom.development.js\"></script>\n</head>\n<body>\n<div id=\"root\"></div>\n{}\n</body>\n</html>\n",
        result.css, loader
    );

    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn builds_bundle_from_app_only_project() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("App.tsx"),
            r#"export default function App(){ return <h1 className="t">hi</h1> }"#,
        )
        .unwrap();

        let html = build_bundle(dir.path()).unwrap();
        assert!(!html.contains("<h1"));
        assert!(html.contains(r#"createElement("h1", {className:"t"}, "hi")"#));
        assert!(html.contains("\"/App.tsx\""));
        assert!(html.contains("ReactDOM.createRoot"));
    }

    #[test]
    fn prefers_index_over_app() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "console.log('entry');").unwrap();
        fs::write(dir.path().join("App.js"), "console.log('app');").unwrap();

        let html = build_bundle(dir.path()).unwrap();
        assert!(html.contains("__devcoreRequire(\"/index.js\")"));
    }

    #[test]
    fn skips_node_modules_and_dotfiles() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "1").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        fs::write(dir.path().join("index.js"), "1").unwrap();

        let mut result = ScanResult { modules: BTreeMap::new(), css: String::new() };
        scan_dir(dir.path(), dir.path(), &mut result).unwrap();
        assert_eq!(result.modules.len(), 1);
        assert!(result.modules.contains_key("/index.js"));
    }

    #[test]
    fn concatenates_css_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.css"), "body{color:red}").unwrap();
        let html = build_bundle(dir.path()).unwrap();
        assert!(html.contains("body{color:red}"));
    }

    #[test]
    fn bundle_build_is_deterministic() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.js"), "console.log('b');").unwrap();
        fs::write(dir.path().join("a.js"), "console.log('a');").unwrap();

        let first = build_bundle(dir.path()).unwrap();
        let second = build_bundle(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
