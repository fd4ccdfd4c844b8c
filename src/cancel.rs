use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::Interrupt;

/// A shared flag used to ask an execution to stop.
///
/// Clones observe the same flag. Cancelling is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything that can stop a run early: the caller's token, the run's own
/// halt flag (raised after the first failure) and an optional deadline.
#[derive(Debug, Clone)]
pub(crate) struct Cancellation {
    external: CancelToken,
    halt: CancelToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub(crate) fn new(external: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            external,
            halt: CancelToken::new(),
            // a deadline past what `Instant` can represent never expires
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    pub(crate) fn halt(&self) {
        self.halt.cancel();
    }

    pub(crate) fn check(&self) -> Result<(), Interrupt> {
        if self.external.is_cancelled() || self.halt.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupt::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_check_reports_cancel_before_deadline() {
        let token = CancelToken::new();
        let cancellation = Cancellation::new(token.clone(), Some(Duration::ZERO));
        assert_eq!(cancellation.check(), Err(Interrupt::DeadlineExceeded));

        token.cancel();
        assert_eq!(cancellation.check(), Err(Interrupt::Cancelled));
    }

    #[test]
    fn test_huge_timeout_never_expires() {
        let cancellation = Cancellation::new(CancelToken::new(), Some(Duration::MAX));
        assert_eq!(cancellation.check(), Ok(()));

        let cancellation = Cancellation::new(CancelToken::new(), Some(Duration::from_secs_f64(1e19)));
        assert_eq!(cancellation.check(), Ok(()));
    }

    #[test]
    fn test_halt_does_not_touch_caller_token() {
        let token = CancelToken::new();
        let cancellation = Cancellation::new(token.clone(), None);
        assert_eq!(cancellation.check(), Ok(()));

        cancellation.halt();
        assert_eq!(cancellation.check(), Err(Interrupt::Cancelled));
        assert!(!token.is_cancelled());
    }
}
