//! JSX and ES-module source rewriter, the core of component H. New relative
//! to the teacher (which never parses project source); grounded on the
//! disambiguation/state-machine guidance spec.md §9 gives directly — a small
//! recursive-descent scanner over (normal, string, line-comment,
//! block-comment) contexts, with JSX element parsing as a nested,
//! fail-soft sub-parser that bails out to passthrough text on anything it
//! does not recognize.

use regex::{Captures, Regex};

/// Rewrites a single source file: JSX first (so the import/export rewrite
/// below sees plain `createElement(...)` calls), then module directives.
pub fn rewrite_module(source: &str) -> String {
    let jsx_rewritten = rewrite_jsx(source);
    rewrite_imports_exports(&jsx_rewritten)
}

// ---------------------------------------------------------------------
// Module directive rewrite (spec.md §4.H, "Module rewrite")
// ---------------------------------------------------------------------

fn rewrite_imports_exports(source: &str) -> String {
    let mut default_export_names = Vec::new();
    let mut named_export_names = Vec::new();

    let default_fn_re = Regex::new(r"(?m)^export default function (\w+)").unwrap();
    let source = default_fn_re
        .replace_all(source, |caps: &Captures| {
            default_export_names.push(caps[1].to_string());
            format!("function {}", &caps[1])
        })
        .into_owned();

    let default_expr_re = Regex::new(r"(?m)^export default (.+)$").unwrap();
    let source = default_expr_re.replace_all(&source, "module.exports = $1").into_owned();

    let named_decl_re = Regex::new(r"(?m)^export (const|let|var) (\w+)").unwrap();
    let source = named_decl_re
        .replace_all(&source, |caps: &Captures| {
            named_export_names.push(caps[2].to_string());
            format!("{} {}", &caps[1], &caps[2])
        })
        .into_owned();

    let named_fn_re = Regex::new(r"(?m)^export function (\w+)").unwrap();
    let source = named_fn_re
        .replace_all(&source, |caps: &Captures| {
            named_export_names.push(caps[1].to_string());
            format!("function {}", &caps[1])
        })
        .into_owned();

    let star_re = Regex::new(r#"import \* as (\w+) from ['"]([^'"]+)['"];?"#).unwrap();
    let source = star_re.replace_all(&source, "const $1 = require('$2');").into_owned();

    let named_import_re = Regex::new(r#"import \{([^}]+)\} from ['"]([^'"]+)['"];?"#).unwrap();
    let source = named_import_re
        .replace_all(&source, "const {$1} = require('$2');")
        .into_owned();

    let default_import_re = Regex::new(r#"import (\w+) from ['"]([^'"]+)['"];?"#).unwrap();
    let source = default_import_re
        .replace_all(&source, "const $1 = __devcoreInteropDefault(require('$2'));")
        .into_owned();

    let bare_import_re = Regex::new(r#"import ['"]([^'"]+)['"];?"#).unwrap();
    let source = bare_import_re.replace_all(&source, "require('$1');").into_owned();

    let mut out = source;
    for name in &default_export_names {
        out.push_str(&format!("\nmodule.exports.default = {name};"));
    }
    for name in &named_export_names {
        out.push_str(&format!("\nmodule.exports.{name} = {name};"));
    }
    out
}

// ---------------------------------------------------------------------
// JSX rewrite (spec.md §4.H, "JSX rewrite")
// ---------------------------------------------------------------------

enum Context {
    Normal,
    Str(char),
    LineComment,
    BlockComment,
}

const EXPR_PREFIX_KEYWORDS: [&str; 13] = [
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "do",
    "else",
    "yield",
    "case",
    "delete",
    "void",
    "new",
    "throw",
];

fn trailing_word(out: &str) -> String {
    out.chars()
        .rev()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Disambiguates `<` as JSX start vs. a comparison operator, per the rule
/// spec.md §9 formalizes.
fn looks_like_jsx_start(out: &str) -> bool {
    let trimmed = out.trim_end();
    let Some(last_char) = trimmed.chars().last() else {
        return true;
    };
    if last_char.is_alphanumeric() || last_char == '_' || last_char == '$' {
        let word = trailing_word(trimmed);
        return EXPR_PREFIX_KEYWORDS.contains(&word.as_str());
    }
    if last_char == ')' || last_char == ']' {
        return false;
    }
    true
}

fn next_looks_like_jsx(chars: &[char], i: usize) -> bool {
    matches!(chars.get(i + 1), Some(c) if c.is_ascii_alphabetic() || *c == '>')
}

pub fn rewrite_jsx(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    let mut context = Context::Normal;

    while i < chars.len() {
        match context {
            Context::Normal => {
                let c = chars[i];
                if c == '\'' || c == '"' || c == '`' {
                    context = Context::Str(c);
                    out.push(c);
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'/') {
                    context = Context::LineComment;
                    out.push(c);
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'*') {
                    context = Context::BlockComment;
                    out.push(c);
                    i += 1;
                } else if c == '<' && next_looks_like_jsx(&chars, i) && looks_like_jsx_start(&out) {
                    if let Some((consumed, js)) = try_parse_jsx_element(&chars, i) {
                        out.push_str(&js);
                        i += consumed;
                    } else {
                        out.push(c);
                        i += 1;
                    }
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            Context::Str(quote) => {
                let c = chars[i];
                out.push(c);
                if c == '\\' {
                    if let Some(&esc) = chars.get(i + 1) {
                        out.push(esc);
                    }
                    i += 2;
                    continue;
                }
                if c == quote {
                    context = Context::Normal;
                }
                i += 1;
            }
            Context::LineComment => {
                let c = chars[i];
                out.push(c);
                if c == '\n' {
                    context = Context::Normal;
                }
                i += 1;
            }
            Context::BlockComment => {
                let c = chars[i];
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    out.push('*');
                    out.push('/');
                    i += 2;
                    context = Context::Normal;
                    continue;
                }
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

enum Closing {
    Fragment,
    Tag(String),
}

fn skip_ws(chars: &[char], p: &mut usize) {
    while matches!(chars.get(*p), Some(c) if c.is_whitespace()) {
        *p += 1;
    }
}

fn parse_identifier(chars: &[char], start: usize) -> Option<(String, usize)> {
    let first = *chars.get(start)?;
    if !(first.is_ascii_alphabetic() || first == '_' || first == '$') {
        return None;
    }
    let mut p = start + 1;
    while matches!(chars.get(p), Some(c) if c.is_ascii_alphanumeric() || *c == '_' || *c == '$' || *c == '.') {
        p += 1;
    }
    Some((chars[start..p].iter().collect(), p))
}

fn parse_attr_name(chars: &[char], start: usize) -> Option<(String, usize)> {
    let first = *chars.get(start)?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let mut p = start + 1;
    while matches!(chars.get(p), Some(c) if c.is_ascii_alphanumeric() || *c == '_' || *c == '-') {
        p += 1;
    }
    Some((chars[start..p].iter().collect(), p))
}

fn parse_string_literal(chars: &[char], start: usize) -> Option<(String, usize)> {
    let quote = *chars.get(start)?;
    let mut buf = String::new();
    buf.push(quote);
    let mut p = start + 1;
    loop {
        let c = *chars.get(p)?;
        buf.push(c);
        if c == '\\' {
            p += 1;
            if let Some(&esc) = chars.get(p) {
                buf.push(esc);
            }
            p += 1;
            continue;
        }
        p += 1;
        if c == quote {
            break;
        }
    }
    Some((buf, p))
}

fn parse_braced_expr(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut depth = 0i32;
    let mut p = start;
    let mut buf = String::new();
    loop {
        let c = *chars.get(p)?;
        match c {
            '{' => {
                depth += 1;
                if depth > 1 {
                    buf.push(c);
                }
                p += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((buf, p + 1));
                }
                buf.push(c);
                p += 1;
            }
            '\'' | '"' | '`' => {
                let (lit, after) = parse_string_literal(chars, p)?;
                buf.push_str(&lit);
                p = after;
            }
            _ => {
                buf.push(c);
                p += 1;
            }
        }
    }
}

fn prop_key(name: &str) -> String {
    if name.contains('-') {
        format!("\"{name}\"")
    } else {
        name.to_string()
    }
}

fn parse_attrs(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut p = start;
    let mut literal_props = Vec::new();
    let mut spreads = Vec::new();

    loop {
        skip_ws(chars, &mut p);
        match chars.get(p) {
            Some('/') | Some('>') | None => break,
            Some('{') => {
                let (expr, after) = parse_braced_expr(chars, p)?;
                let spread_expr = expr.trim().strip_prefix("...")?.trim().to_string();
                spreads.push(spread_expr);
                p = after;
            }
            Some(_) => {
                let (name, after) = parse_attr_name(chars, p)?;
                p = after;
                skip_ws(chars, &mut p);
                if chars.get(p) == Some(&'=') {
                    p += 1;
                    skip_ws(chars, &mut p);
                    let value = match chars.get(p) {
                        Some('"') | Some('\'') => {
                            let (lit, after) = parse_string_literal(chars, p)?;
                            p = after;
                            lit
                        }
                        Some('{') => {
                            let (expr, after) = parse_braced_expr(chars, p)?;
                            p = after;
                            expr
                        }
                        _ => return None,
                    };
                    literal_props.push(format!("{}:{}", prop_key(&name), value));
                } else {
                    literal_props.push(format!("{}:true", prop_key(&name)));
                }
            }
        }
    }

    let props = if !spreads.is_empty() {
        let literal_obj = format!("{{{}}}", literal_props.join(", "));
        let mut parts = spreads;
        parts.push(literal_obj);
        format!("Object.assign({{}}, {})", parts.join(", "))
    } else if literal_props.is_empty() {
        "null".to_string()
    } else {
        format!("{{{}}}", literal_props.join(", "))
    };

    Some((props, p))
}

fn flush_text(children: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        children.push(serde_json::to_string(trimmed).unwrap_or_else(|_| "\"\"".to_string()));
    }
}

fn parse_children(chars: &[char], start: usize, closing: &Closing) -> Option<(Vec<String>, usize)> {
    let mut children = Vec::new();
    let mut text_buf = String::new();
    let mut p = start;

    loop {
        match chars.get(p) {
            None => return None,
            Some('<') => {
                let mut q = p + 1;
                if chars.get(q) == Some(&'/') {
                    q += 1;
                    let end = match closing {
                        Closing::Fragment => {
                            skip_ws(chars, &mut q);
                            if chars.get(q) == Some(&'>') { Some(q + 1) } else { None }
                        }
                        Closing::Tag(name) => {
                            let (closing_name, after) = parse_identifier(chars, q)?;
                            if &closing_name != name {
                                return None;
                            }
                            let mut after2 = after;
                            skip_ws(chars, &mut after2);
                            if chars.get(after2) == Some(&'>') { Some(after2 + 1) } else { None }
                        }
                    };
                    let end = end?;
                    flush_text(&mut children, &text_buf);
                    return Some((children, end - start));
                }
                flush_text(&mut children, &text_buf);
                text_buf.clear();
                let (consumed, js) = try_parse_jsx_element(chars, p)?;
                children.push(js);
                p += consumed;
            }
            Some('{') => {
                flush_text(&mut children, &text_buf);
                text_buf.clear();
                let (expr, after) = parse_braced_expr(chars, p)?;
                children.push(expr.trim().to_string());
                p = after;
            }
            Some(c) => {
                text_buf.push(*c);
                p += 1;
            }
        }
    }
}

fn tag_ref(name: &str) -> String {
    if name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

fn try_parse_jsx_element(chars: &[char], start: usize) -> Option<(usize, String)> {
    let mut p = start + 1;

    if chars.get(p) == Some(&'>') {
        p += 1;
        let (children, consumed) = parse_children(chars, p, &Closing::Fragment)?;
        let end = p + consumed;
        let suffix = if children.is_empty() { String::new() } else { format!(", {}", children.join(", ")) };
        return Some((end - start, format!("createElement(Fragment, null{suffix})")));
    }

    let (tag_name, after_name) = parse_identifier(chars, p)?;
    p = after_name;
    let (props, after_props) = parse_attrs(chars, p)?;
    p = after_props;
    skip_ws(chars, &mut p);

    if chars.get(p) == Some(&'/') && chars.get(p + 1) == Some(&'>') {
        p += 2;
        return Some((p - start, format!("createElement({}, {})", tag_ref(&tag_name), props)));
    }

    if chars.get(p) == Some(&'>') {
        p += 1;
        let (children, consumed) = parse_children(chars, p, &Closing::Tag(tag_name.clone()))?;
        p += consumed;
        let suffix = if children.is_empty() { String::new() } else { format!(", {}", children.join(", ")) };
        return Some((p - start, format!("createElement({}, {}{suffix})", tag_ref(&tag_name), props)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_self_closing_element_with_string_prop() {
        let out = rewrite_jsx(r#"const el = <img src="a.png" />;"#);
        assert_eq!(out, r#"const el = createElement("img", {src:"a.png"});"#);
    }

    #[test]
    fn rewrites_default_export_function_with_jsx_body() {
        let source = r#"export default function App(){ return <h1 className="t">hi</h1> }"#;
        let out = rewrite_module(source);
        assert!(!out.contains("<h1"));
        assert!(out.contains(r#"createElement("h1", {className:"t"}, "hi")"#));
        assert!(out.starts_with("function App"));
        assert!(out.contains("module.exports.default = App;"));
    }

    #[test]
    fn rewrites_component_reference_uppercase_tag() {
        let out = rewrite_jsx("const el = <Foo bar={1} />;");
        assert_eq!(out, "const el = createElement(Foo, {bar:1});");
    }

    #[test]
    fn rewrites_fragment_with_children() {
        let out = rewrite_jsx("const el = <>hi<b>there</b></>;");
        assert_eq!(out, r#"const el = createElement(Fragment, null, "hi", createElement("b", null, "there"));"#);
    }

    #[test]
    fn rewrites_spread_props() {
        let out = rewrite_jsx("const el = <div {...rest} id=\"x\" />;");
        assert_eq!(out, r#"const el = createElement("div", Object.assign({}, rest, {id:"x"}));"#);
    }

    #[test]
    fn leaves_comparison_operator_untouched() {
        let out = rewrite_jsx("if (a < b) { return c; }");
        assert_eq!(out, "if (a < b) { return c; }");
    }

    #[test]
    fn leaves_unparseable_tag_untouched() {
        let out = rewrite_jsx("const bad = <1notATag>;");
        assert_eq!(out, "const bad = <1notATag>;");
    }

    #[test]
    fn jsx_rewrite_is_idempotent() {
        let once = rewrite_jsx(r#"const el = <h1 className="t">hi</h1>;"#);
        let twice = rewrite_jsx(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn rewrites_named_imports_and_exports() {
        let out = rewrite_imports_exports(
            "import {useState} from 'react';\nimport React from 'react';\nexport const Count = 1;\n",
        );
        assert!(out.contains("const {useState} = require('react');"));
        assert!(out.contains("const React = __devcoreInteropDefault(require('react'));"));
        assert!(out.contains("const Count = 1;"));
        assert!(out.contains("module.exports.Count = Count;"));
    }
}
