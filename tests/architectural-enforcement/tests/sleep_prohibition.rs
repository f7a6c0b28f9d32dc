//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code never blocks a thread with `std::thread::sleep`,
//! and never waits on a bare timer. Every timed wait goes through
//! `CancelToken::sleep` so a stop request interrupts it.
//!
//! **Exception**: `cancel.rs`, which implements that wait.

use architectural_enforcement::{production_lines, SourceLine};

const TIMER_HOME: &str = "chatflow/core/src/cancel.rs";

fn is_violation(line: &SourceLine) -> bool {
    if line.code.contains("thread::sleep(") {
        return true;
    }
    line.code.contains("time::sleep(") && !line.path.ends_with(TIMER_HOME)
}

#[test]
fn test_no_uncancellable_sleep_in_production_code() {
    let violations: Vec<String> = production_lines()
        .iter()
        .filter(|line| is_violation(line))
        .map(SourceLine::report)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Uncancellable sleeps found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use CancelToken::sleep or token.run_until_cancelled(...)");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
