//! Panic isolation for subscriber callbacks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Run a subscriber callback, converting a panic into its message.
///
/// Callbacks are user code; one misbehaving subscriber must not abort delivery
/// to the others or unwind through the dispatcher.
pub(crate) fn run_isolated<F>(callback: F) -> Result<(), String>
where
    F: FnOnce(),
{
    catch_unwind(AssertUnwindSafe(callback)).map_err(panic_message)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_ok_for_well_behaved_callbacks() {
        let mut ran = false;
        assert!(run_isolated(|| ran = true).is_ok());
        assert!(ran);
    }

    #[test]
    fn captures_panic_message() {
        let err = run_isolated(|| panic!("boom")).expect_err("panic should be captured");
        assert_eq!(err, "boom");

        let formatted = run_isolated(|| panic!("code {}", 7)).expect_err("panic captured");
        assert_eq!(formatted, "code 7");
    }
}
