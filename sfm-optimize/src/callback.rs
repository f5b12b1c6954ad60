use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Progress reported to callbacks once per solver iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Current value of `½ Σ ρ(s)`.
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReturn {
    Continue,
    /// Stop the solver and keep the current parameters.
    Abort,
}

/// Invoked after every solver iteration.
pub trait IterationCallback: Send + Sync {
    fn on_iteration(&self, summary: &IterationSummary) -> CallbackReturn;
}

impl<F> IterationCallback for F
where
    F: Fn(&IterationSummary) -> CallbackReturn + Send + Sync,
{
    fn on_iteration(&self, summary: &IterationSummary) -> CallbackReturn {
        self(summary)
    }
}

/// A cooperative cancellation flag shared between a caller and long running work.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StopToken(#[cfg_attr(feature = "serde-serialize", serde(skip))] Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl IterationCallback for StopToken {
    fn on_iteration(&self, _: &IterationSummary) -> CallbackReturn {
        if self.is_stopped() {
            CallbackReturn::Abort
        } else {
            CallbackReturn::Continue
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = StopToken::new();
        let clone = token.clone();
        clone.stop();
        assert!(token.is_stopped());
        let summary = IterationSummary {
            iteration: 0,
            cost: 0.0,
        };
        assert_eq!(token.on_iteration(&summary), CallbackReturn::Abort);
        token.reset();
        assert_eq!(clone.on_iteration(&summary), CallbackReturn::Continue);
    }
}
