use std::collections::HashSet;
use std::sync::Mutex;
use lazy_static::lazy_static;
use log::{error, info};

lazy_static! {
    /// Descriptions of every invariant that has been asserted and held.
    static ref CHECKED_INVARIANTS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Asserts that a scan or run invariant holds.
///
/// A violation panics in debug/test builds and is logged as an error in release
/// builds. When the invariant holds it is recorded, so tests can later prove it
/// was actually checked (see [`contract_test`]).
///
/// # Arguments
/// * `condition` - The boolean result of the check.
/// * `description` - Human-readable invariant, e.g. "Progress never decreases".
/// * `component` - Tag for the log line ("Locator", "Runner").
pub fn assert_invariant(condition: bool, description: &str, component: &str) {
    if !condition {
        let msg = format!("INVARIANT VIOLATION [{}]: {}", component, description);
        error!("{}", msg);
        if cfg!(debug_assertions) || cfg!(test) {
            panic!("{}", msg);
        }
        return;
    }

    if let Ok(mut set) = CHECKED_INVARIANTS.lock() {
        set.insert(description.to_string());
    }
}

/// Panics unless every invariant in `required` has been asserted at least once.
#[allow(dead_code)]
pub fn contract_test(context: &str, required: &[&str]) {
    let checked = CHECKED_INVARIANTS.lock().unwrap();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|req| !checked.contains(*req))
        .collect();

    if !missing.is_empty() {
        panic!(
            "Contract Test Failed for '{}'. The following invariants were NOT checked:\n{:#?}",
            context, missing
        );
    }
    info!("Contract Test Passed: {}", context);
}
