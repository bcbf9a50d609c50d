//! Integration test runner
//!
//! Runs every integration test category and prints a summary.
//!
//! # Usage
//!
//! Run all categories:
//! ```text
//! cargo run -p busline-integration-tests
//! ```
//!
//! Run one category:
//! ```text
//! cargo test -p busline-integration-tests --test loopback_tests
//! cargo test -p busline-integration-tests --test signal_tests
//! cargo test -p busline-integration-tests --test threading_tests
//! cargo test -p busline-integration-tests --test timeout_tests
//! cargo test -p busline-integration-tests --test peer_tests
//! ```
//!
//! Run with more logging:
//! ```text
//! RUST_LOG=debug cargo run -p busline-integration-tests
//! ```

use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "Loopback Tests",
        description: "Calls a connection answers for itself, built-in interfaces",
        test_name: "loopback_tests",
    },
    TestCategory {
        name: "Signal Tests",
        description: "Subscriptions, filters, owner tracking, spy hooks",
        test_name: "signal_tests",
    },
    TestCategory {
        name: "Threading Tests",
        description: "Objects homed on other threads, async callers",
        test_name: "threading_tests",
    },
    TestCategory {
        name: "Timeout Tests",
        description: "Expiring calls and reply callbacks",
        test_name: "timeout_tests",
    },
    TestCategory {
        name: "Peer Tests",
        description: "Listening servers and peer-to-peer links",
        test_name: "peer_tests",
    },
];

fn print_categories() {
    println!("Test Categories:");
    println!("{}", "-".repeat(80));
    for (i, cat) in TEST_CATEGORIES.iter().enumerate() {
        println!("  {}. {} - {}", i + 1, cat.name, cat.description);
    }
    println!("{}", "-".repeat(80));
    println!();
}

fn run_test_category(category: &TestCategory) -> (bool, Duration, String) {
    info!("running {}", category.name);
    let start = Instant::now();

    let output = Command::new("cargo")
        .args([
            "test",
            "-p",
            "busline-integration-tests",
            "--test",
            category.test_name,
            "--",
            "--nocapture",
        ])
        .output();

    let duration = start.elapsed();

    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.is_empty() {
                println!("{}", stdout);
            }
            if !stderr.is_empty() {
                eprintln!("{}", stderr);
            }

            let success = output.status.success();
            let summary = if success {
                "PASSED".to_string()
            } else {
                format!("FAILED (exit code: {:?})", output.status.code())
            };
            (success, duration, summary)
        }
        Err(e) => {
            error!("could not run {}: {}", category.test_name, e);
            (false, duration, format!("Failed to execute: {}", e))
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("busline integration suite");
    print_categories();

    let total_start = Instant::now();
    let mut results = Vec::new();
    for category in TEST_CATEGORIES {
        let (success, duration, summary) = run_test_category(category);
        results.push((category.name, success, duration, summary));
    }
    let total_duration = total_start.elapsed();

    println!("\n{}", "=".repeat(80));
    println!("FINAL SUMMARY");
    println!("{}", "=".repeat(80));

    let passed = results.iter().filter(|(_, s, _, _)| *s).count();
    let failed = results.len() - passed;
    println!("\nCategories: {} | Passed: {} | Failed: {}", results.len(), passed, failed);
    println!("Total Duration: {:?}", total_duration);
    println!();

    println!("{:<30} {:<10} {:<15} Details", "Category", "Status", "Duration");
    println!("{}", "-".repeat(80));
    for (name, success, duration, summary) in &results {
        let status = if *success { "PASS" } else { "FAIL" };
        println!("{:<30} {:<10} {:<15?} {}", name, status, duration, summary);
    }
    println!("{}", "=".repeat(80));

    if failed > 0 {
        println!("\nSome tests failed!");
        std::process::exit(1);
    }
    println!("\nAll tests passed!");
}
