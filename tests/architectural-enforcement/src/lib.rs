//! Architectural Enforcement Helpers
//!
//! Source scanning shared by the enforcement tests in `tests/`:
//! - No blocking sleeps in production code
//! - No blocking I/O inside async functions
//!
//! Production code is everything under a crate's `src/` up to its first
//! `#[cfg(test)]` module. Comments are stripped before matching.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories checked by every rule
pub const PRODUCTION_DIRS: &[&str] = &["chatflow/core/src", "chatflow/cli/src"];

/// One line of production code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any `//` comment removed
    pub code: String,
    /// Whether the nearest enclosing function is `async`
    pub in_async_fn: bool,
}

impl SourceLine {
    /// Format as a violation report entry
    pub fn report(&self) -> String {
        format!(
            "{}:{} - {}",
            self.path.display(),
            self.number,
            self.code.trim()
        )
    }
}

/// Workspace root, resolved from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .to_path_buf()
}

/// All `.rs` files under the production directories
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

/// Production lines of every production file
pub fn production_lines() -> Vec<SourceLine> {
    production_files()
        .into_iter()
        .flat_map(|path| match fs::read_to_string(&path) {
            Ok(content) => scan(&path, &content),
            Err(_) => Vec::new(),
        })
        .collect()
}

/// Split `content` into production lines
pub fn scan(path: &Path, content: &str) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    let mut in_async_fn = false;

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }

        let code = line.split("//").next().unwrap_or(line);
        let signature = strip_visibility(code.trim_start());
        if signature.starts_with("async fn ") {
            in_async_fn = true;
        } else if signature.starts_with("fn ") {
            in_async_fn = false;
        }

        if code.trim().is_empty() {
            continue;
        }
        lines.push(SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: code.to_string(),
            in_async_fn,
        });
    }
    lines
}

fn strip_visibility(line: &str) -> &str {
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest;
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_stops_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        let lines = scan(Path::new("x.rs"), content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code, "fn a() {}");
    }

    #[test]
    fn test_scan_tracks_async_functions() {
        let content = "pub async fn a() {\n    x();\n}\nfn b() {\n    y();\n}\n";
        let lines = scan(Path::new("x.rs"), content);
        let flags: Vec<(usize, bool)> = lines.iter().map(|l| (l.number, l.in_async_fn)).collect();
        assert_eq!(
            flags,
            vec![(1, true), (2, true), (3, true), (4, false), (5, false), (6, false)]
        );
    }

    #[test]
    fn test_scan_strips_comments() {
        let lines = scan(Path::new("x.rs"), "// std::fs::read\nlet a = 1; // note\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code, "let a = 1; ");
    }

    #[test]
    fn test_production_sources_found() {
        assert!(
            production_files()
                .iter()
                .any(|p| p.ends_with("chatflow/core/src/controller.rs")),
            "workspace layout changed; update PRODUCTION_DIRS"
        );
    }
}
