use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable cancellation flag shared between a request and the blocking
/// work it spawned.
///
/// The token is polled, never waited on: the native inference library polls
/// it through its abort callback, the segmenter checks it between decoded
/// frames, and the model store checks it between download chunks. All clones
/// observe the same flag, and cancellation is sticky.
///
/// Tokens form a tree: a [`CancelToken::child`] trips when either its own
/// flag or any ancestor's flag is set, so one process-wide shutdown token
/// reaches every in-flight request without requests cancelling each other.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that observes this one in addition to its own flag.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Trip the token (and every child derived from it). Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}
