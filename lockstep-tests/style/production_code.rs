//! Production Code Enforcement
//!
//! Library and binary code propagates errors instead of panicking on them,
//! and carries no `#[allow(dead_code)]`. Test modules, test-only files,
//! benches and this crate are exempt.

use std::fs;
use std::path::{Path, PathBuf};

/// A forbidden pattern found in production code
#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    rule: &'static str,
    context: String,
}

/// Patterns checked on every production line, with the rule they break
const RULES: [(&str, &str); 3] = [
    (".unwrap()", "unwrap in production code"),
    (".expect(", "expect in production code"),
    ("dead_code", "dead code allowance"),
];

/// Violations in one source file.
///
/// Everything from the first `#[cfg(test)]` on is test code; comment lines
/// are skipped.
fn check_source(file_path: &str, content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        for (pattern, rule) in RULES {
            let hit = if pattern == "dead_code" {
                trimmed.contains("#[allow(") && trimmed.contains(pattern)
            } else {
                trimmed.contains(pattern)
            };
            if hit {
                violations.push(Violation {
                    file_path: file_path.to_string(),
                    line_number: index + 1,
                    rule,
                    context: line.to_string(),
                });
            }
        }
    }
    violations
}

/// Whether `path` only ever compiles into tests or benches
fn is_test_only(path: &Path) -> bool {
    let path_str = path.to_string_lossy().replace('\\', "/");
    path_str.contains("/tests/")
        || path_str.contains("/benches/")
        || path_str.contains("lockstep-tests/")
        || path_str.ends_with("test_support.rs")
        || path_str.ends_with("test_mocks.rs")
}

fn find_rust_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name()
            && (name.to_string_lossy().starts_with('.') || name == "target")
        {
            continue;
        }
        if path.is_dir() {
            find_rust_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    Ok(())
}

/// Source files of every `lockstep-*` crate
fn workspace_files() -> std::io::Result<Vec<PathBuf>> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").canonicalize()?;
    let mut files = Vec::new();
    for entry in fs::read_dir(&root)? {
        let path = entry?.path();
        let is_crate = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("lockstep-"));
        if is_crate && path.is_dir() {
            find_rust_files(&path, &mut files)?;
        }
    }
    Ok(files)
}

fn report(violations: &[Violation], files_checked: usize) -> bool {
    if violations.is_empty() {
        println!("Production code: {files_checked} files checked, no violations found");
        return true;
    }

    println!("Production code violations found:");
    println!();
    for violation in violations {
        println!("{}:{} ({})", violation.file_path, violation.line_number, violation.rule);
        println!("  {}", violation.context.trim());
        println!();
    }
    println!(
        "Found {} violation(s) in {} file(s) checked",
        violations.len(),
        files_checked
    );
    println!();
    println!("Return the error with `?` or map it into the crate's error type.");
    println!("Move code only tests need into a #[cfg(test)] module.");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_test_only() {
        assert!(is_test_only(Path::new("../lockstep-core/benches/device_cache.rs")));
        assert!(is_test_only(Path::new("../lockstep-tests/integration/support.rs")));
        assert!(is_test_only(Path::new("../lockstep-transport/src/test_support.rs")));
        assert!(is_test_only(Path::new("../lockstep-core/src/engine/test_mocks.rs")));

        assert!(!is_test_only(Path::new("../lockstep-core/src/lib.rs")));
        assert!(!is_test_only(Path::new("../lockstep-transport/src/json/client.rs")));
    }

    #[test]
    fn test_detection_stops_at_test_module() {
        let content = r#"
#[allow(dead_code)]
fn parse(input: &str) -> u32 {
    // input.parse().unwrap() would panic
    input.parse().unwrap()
}

fn first(values: &[u32]) -> u32 {
    *values.first().expect("non-empty")
}

fn fallback(input: &str) -> u32 {
    input.parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_parse() {
        assert_eq!(super::parse("4"), 4);
        "5".parse::<u32>().unwrap();
    }
}
"#;

        let violations = check_source("sample.rs", content);

        let lines: Vec<(usize, &str)> =
            violations.iter().map(|v| (v.line_number, v.rule)).collect();
        assert_eq!(
            lines,
            vec![
                (2, "dead code allowance"),
                (5, "unwrap in production code"),
                (9, "expect in production code"),
            ]
        );
    }

    #[test]
    fn production_code_enforcement() {
        let files = workspace_files().unwrap();
        let mut violations = Vec::new();
        let mut files_checked = 0;
        for file in files.iter().filter(|f| !is_test_only(f)) {
            let content = fs::read_to_string(file).unwrap();
            violations.extend(check_source(&file.to_string_lossy(), &content));
            files_checked += 1;
        }

        assert!(files_checked > 0, "no lockstep sources found");
        assert!(
            report(&violations, files_checked),
            "Production code violations found - see output above"
        );
    }
}
