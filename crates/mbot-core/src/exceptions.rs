use mbot_channels::Failure;

/// Collects the failures of successive login rounds so the final error can report all of
/// them, not only the last one.
///
/// Failures with the same message as one already collected are dropped; servers tend to
/// repeat themselves on every retry.
#[derive(Debug, Default)]
pub struct ExceptionCollector {
    failures: Vec<Failure>,
}

impl ExceptionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an equivalent failure was already collected.
    pub fn collect(&mut self, failure: Failure) -> bool {
        let message = failure.to_string();
        if self
            .failures
            .iter()
            .any(|f| f.ptr_eq(&failure) || f.to_string() == message)
        {
            return false;
        }
        self.failures.push(failure);
        true
    }

    pub fn last(&self) -> Option<&Failure> {
        self.failures.last()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Takes all collected failures, oldest first.
    pub fn drain(&mut self) -> Vec<Failure> {
        std::mem::take(&mut self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_distinct_failures_in_order() {
        let mut c = ExceptionCollector::new();
        let first = Failure::msg("wrong password");
        assert!(c.collect(first.clone()));
        assert!(!c.collect(first));
        assert!(!c.collect(Failure::msg("wrong password")));
        assert!(c.collect(Failure::msg("captcha required")));

        assert_eq!(c.len(), 2);
        assert_eq!(c.last().unwrap().to_string(), "captcha required");

        let all = c.drain();
        assert_eq!(all[0].to_string(), "wrong password");
        assert!(c.is_empty());
    }
}
