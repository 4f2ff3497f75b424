use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Issues cancellation tokens for one axis of work (series load, overlay draw, ...).
///
/// Only the most recently issued token is live. Issuing a new token or calling
/// [`TokenSource::cancel`] invalidates every token handed out before.
#[derive(Debug, Clone, Default)]
pub struct TokenSource {
    generation: Arc<AtomicU64>,
}

/// Cooperative cancellation token, checked after every suspension point.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate all outstanding tokens and return the new live one.
    pub fn issue(&self) -> CancellationToken {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        CancellationToken {
            generation,
            current: Arc::clone(&self.generation),
        }
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl CancellationToken {
    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        !self.is_live()
    }
}
