//! Artifact extraction from model output.
//!
//! Worker models are asked to return a JSON object mapping file paths to
//! contents, but real output drifts. Parsing tries strategies in order:
//! a JSON `artifacts` map, then fenced code blocks labelled with a path,
//! then path-like markdown headings. Whatever survives is filtered through
//! a deny list and a junk-name cleanup pass.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Named outputs of one task or run, keyed by relative path.
pub type ArtifactSet = BTreeMap<String, String>;

/// Paths never accepted from model output, matched per component.
const DENY_LIST: &[&str] = &[
    ".env",
    ".git",
    ".ssh",
    ".aws",
    "id_rsa",
    "node_modules",
    "target",
    "__pycache__",
];

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./\-]*\.[A-Za-z0-9]{1,8}").expect("Invalid path regex")
});

static JUNK_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(path/to/|your[_-]|example\.|file\.ext$|filename\.|untitled)")
        .expect("Invalid junk name regex")
});

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(todo|tbd|n/a|\.{3,}|<[^>]+>)[.!]?$").expect("Invalid placeholder regex")
});

/// Extract artifacts from raw model output, trying strategies in order.
pub fn parse_artifacts(output: &str) -> ArtifactSet {
    if let Some(set) = parse_json_artifacts(output) {
        return cleanup(set);
    }
    let fenced = parse_fenced_blocks(output);
    if !fenced.is_empty() {
        return cleanup(fenced);
    }
    cleanup(parse_heading_sections(output))
}

/// True when a path must never appear in merged output.
pub fn is_denied(path: &str) -> bool {
    path.split('/')
        .any(|component| DENY_LIST.iter().any(|d| component.eq_ignore_ascii_case(d)))
}

fn parse_json_artifacts(output: &str) -> Option<ArtifactSet> {
    let json = extract_json(output);
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let object = value.as_object()?;

    // Preferred shape: {"artifacts": {"path": "content", ...}}.
    let map = match object.get("artifacts").and_then(|v| v.as_object()) {
        Some(inner) => inner,
        None => object,
    };

    let mut set = ArtifactSet::new();
    for (name, content) in map {
        if let Some(text) = content.as_str() {
            set.insert(name.clone(), text.to_string());
        }
    }
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

/// Fenced code blocks whose preceding non-empty line names a path.
/// Unlabelled blocks are dropped.
fn parse_fenced_blocks(output: &str) -> ArtifactSet {
    let mut set = ArtifactSet::new();
    let mut last_path: Option<String> = None;
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some((name, body)) => {
                    set.insert(name, body.join("\n"));
                    last_path = None;
                }
                None => {
                    if let Some(name) = last_path.take() {
                        current = Some((name, Vec::new()));
                    }
                }
            }
            continue;
        }
        match &mut current {
            Some((_, body)) => body.push(line),
            None => {
                if !line.trim().is_empty() {
                    last_path = PATH_RE.find(line).map(|m| m.as_str().to_string());
                }
            }
        }
    }
    set
}

/// Markdown sections whose heading is a bare path.
fn parse_heading_sections(output: &str) -> ArtifactSet {
    let mut set = ArtifactSet::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            if let Some((name, body)) = current.take() {
                set.insert(name, body.join("\n").trim().to_string());
            }
            let heading = trimmed.trim_start_matches('#').trim().trim_matches('`');
            if PATH_RE.is_match(heading) && !heading.contains(' ') {
                current = Some((heading.to_string(), Vec::new()));
            }
            continue;
        }
        if let Some((_, body)) = &mut current {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        set.insert(name, body.join("\n").trim().to_string());
    }
    set
}

/// Drop denied paths, junk names, and empty or placeholder-only content.
pub fn cleanup(set: ArtifactSet) -> ArtifactSet {
    set.into_iter()
        .filter(|(name, content)| {
            if name.len() > 200 || name.chars().any(char::is_whitespace) {
                return false;
            }
            if is_denied(name) || JUNK_NAME_RE.is_match(name) {
                return false;
            }
            let body = content.trim();
            !body.is_empty() && !PLACEHOLDER_RE.is_match(body)
        })
        .collect()
}

/// Best-effort extraction of a JSON object from free text. Returns the first
/// balanced `{...}` span, or the trimmed input when none is found.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the matching closing brace. Tracks "inside string"
/// state so braces within `"..."` are not counted.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_artifacts_map_wins() {
        let output = r##"Here is the result:
{"artifacts": {"src/main.rs": "fn main() {}", "README.md": "# app"}}
Also a stray block:
src/other.rs
```rust
fn other() {}
```"##;
        let set = parse_artifacts(output);
        assert_eq!(set.len(), 2);
        assert_eq!(set["src/main.rs"], "fn main() {}");
        assert_eq!(set["README.md"], "# app");
    }

    #[test]
    fn bare_json_object_of_strings_accepted() {
        let output = r#"{"index.html": "<html></html>", "style.css": "body {}"}"#;
        let set = parse_artifacts(output);
        assert_eq!(set.len(), 2);
        assert_eq!(set["style.css"], "body {}");
    }

    #[test]
    fn fenced_blocks_take_name_from_preceding_line() {
        let output = "Create the entry point.\n\n### src/app.py\n```python\nprint('hi')\n```\n\nAnd an unlabelled block:\n\n```\nignore me\n```";
        let set = parse_artifacts(output);
        assert_eq!(set.len(), 1);
        assert_eq!(set["src/app.py"], "print('hi')");
    }

    #[test]
    fn heading_sections_used_as_last_resort() {
        let output = "## config.toml\nkey = true\n\n## Some Prose Heading\nnot a file";
        let set = parse_artifacts(output);
        assert_eq!(set.len(), 1);
        assert_eq!(set["config.toml"], "key = true");
    }

    #[test]
    fn deny_list_strips_sensitive_paths() {
        let output = r#"{".env": "SECRET=1", "app/.git/config": "x", "src/ok.rs": "fn f() {}"}"#;
        let set = parse_artifacts(output);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key("src/ok.rs"));
    }

    #[test]
    fn cleanup_drops_placeholders_and_junk_names() {
        let mut set = ArtifactSet::new();
        set.insert("path/to/file.rs".into(), "real content".into());
        set.insert("src/lib.rs".into(), "TODO".into());
        set.insert("src/empty.rs".into(), "   ".into());
        set.insert("src/good.rs".into(), "pub fn f() {}".into());
        let cleaned = cleanup(set);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned.contains_key("src/good.rs"));
    }

    #[test]
    fn extract_json_handles_braces_in_strings() {
        let raw = r#"prefix {"a": "has } brace", "b": 2} suffix"#;
        let json = extract_json(raw);
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["b"], 2);
    }

    #[test]
    fn extract_json_returns_input_when_unbalanced() {
        assert_eq!(extract_json("{ no close"), "{ no close");
    }
}
