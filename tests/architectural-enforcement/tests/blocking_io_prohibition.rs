//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions in production code MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::io`, and the async `reqwest` client.
//!
//! Synchronous functions may still block, e.g. configuration loading before
//! the runtime starts.

use architectural_enforcement::{production_lines, SourceLine};

const FORBIDDEN: &[&str] = &[
    "std::fs::",
    "std::net::",
    "std::process::Command",
    "reqwest::blocking",
    "std::io::stdin",
];

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations: Vec<String> = production_lines()
        .iter()
        .filter(|line| line.in_async_fn)
        .filter(|line| FORBIDDEN.iter().any(|pattern| line.code.contains(pattern)))
        .map(SourceLine::report)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found inside async functions!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN in async code:");
        for pattern in FORBIDDEN {
            eprintln!("  - {pattern}");
        }

        panic!(
            "\nFound {} blocking I/O violation(s) in async functions.",
            violations.len()
        );
    }
}
