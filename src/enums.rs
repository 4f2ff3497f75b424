use crate::instance::SeriesRef;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single viewer instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewerPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
}

/// Eviction policy of the decode cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Keep every decoded slice for the whole session.
    #[default]
    Unbounded,
    /// Least-recently-used eviction once more than `n` slices are cached.
    MaxEntries(usize),
}

/// Result of an asynchronous step whose inputs may change while it is suspended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Committed(T),
    /// The triggering inputs changed; the result was dropped.
    Stale,
}

impl<T> Outcome<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Outcome::Stale)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Committed(value) => Outcome::Committed(f(value)),
            Outcome::Stale => Outcome::Stale,
        }
    }
}

/// Events that force the viewer to re-render some part of its output.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    SeriesChanged(Option<SeriesRef>),
    OverlayChanged(Option<SeriesRef>),
    SliceChanged(usize),
    LabelConfigChanged,
    ViewportChanged,
}
