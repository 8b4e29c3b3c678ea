use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::*;

const MAX_KEPT_ERRORS: usize = 64;

/// Collects user-facing error messages. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    errors: Arc<Mutex<VecDeque<String>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, error: impl Into<String>) {
        let error = error.into();
        warn!("{error}");
        let mut errors = self.errors.lock();
        if errors.len() == MAX_KEPT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(error);
    }

    pub fn latest(&self) -> Option<String> {
        self.errors.lock().back().cloned()
    }

    /// Oldest first.
    pub fn all(&self) -> Vec<String> {
        self.errors.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_is_shared_between_clones() {
        let sink = ErrorSink::new();
        let other = sink.clone();
        assert!(sink.is_empty());

        other.report("first");
        sink.report(String::from("second"));

        assert_eq!(sink.all(), vec!["first", "second"]);
        assert_eq!(other.latest().as_deref(), Some("second"));
    }

    #[test]
    fn test_oldest_errors_are_dropped() {
        let sink = ErrorSink::new();
        for i in 0..MAX_KEPT_ERRORS + 3 {
            sink.report(format!("error {i}"));
        }
        let all = sink.all();
        assert_eq!(all.len(), MAX_KEPT_ERRORS);
        assert_eq!(all[0], "error 3");
        assert_eq!(sink.latest(), Some(format!("error {}", MAX_KEPT_ERRORS + 2)));
    }
}
