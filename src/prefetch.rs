use crate::{enums::Outcome, instance::ImageId, slice_cache::DecodeCache, token::CancellationToken};

use futures::future::join_all;
use log::debug;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use web_time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchProgress {
    pub loaded: usize,
    pub total: usize,
}

impl PrefetchProgress {
    pub fn is_complete(&self) -> bool {
        self.loaded >= self.total
    }
}

/// Load `image_ids` into the cache in concurrent batches.
///
/// The first `already_loaded` ids count as loaded without being requested.
/// Failed members are counted as settled and otherwise ignored. No batch starts
/// once `token` is dead.
pub async fn prefetch_series(
    cache: &DecodeCache,
    image_ids: &[ImageId],
    already_loaded: usize,
    batch_size: usize,
    token: &CancellationToken,
    progress: &watch::Sender<PrefetchProgress>,
) -> Outcome<PrefetchProgress> {
    let started = Instant::now();
    let already_loaded = already_loaded.min(image_ids.len());
    let mut current = PrefetchProgress {
        loaded: already_loaded,
        total: image_ids.len(),
    };
    progress.send_replace(current);

    for batch in image_ids[already_loaded..].chunks(batch_size.max(1)) {
        if token.is_cancelled() {
            return Outcome::Stale;
        }
        let results = join_all(batch.iter().map(|image_id| cache.decode(image_id))).await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            debug!("prefetch batch finished with {failed} failed slices");
        }
        if token.is_cancelled() {
            return Outcome::Stale;
        }
        current.loaded += batch.len();
        progress.send_replace(current);
    }

    debug!(
        "prefetched {} slices in {:?}",
        current.total - already_loaded,
        started.elapsed()
    );
    Outcome::Committed(current)
}

/// A running background prefetch.
pub struct PrefetchHandle {
    progress: watch::Receiver<PrefetchProgress>,
    task: JoinHandle<Outcome<PrefetchProgress>>,
}

impl PrefetchHandle {
    pub fn spawn(
        cache: Arc<DecodeCache>,
        image_ids: Vec<ImageId>,
        already_loaded: usize,
        batch_size: usize,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(PrefetchProgress {
            loaded: already_loaded.min(image_ids.len()),
            total: image_ids.len(),
        });
        let task = tokio::spawn(async move {
            prefetch_series(&cache, &image_ids, already_loaded, batch_size, &token, &tx).await
        });
        Self { progress: rx, task }
    }

    pub fn progress(&self) -> PrefetchProgress {
        *self.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrefetchProgress> {
        self.progress.clone()
    }

    /// Wait for the prefetch to settle.
    pub async fn finished(self) -> Outcome<PrefetchProgress> {
        self.task.await.unwrap_or(Outcome::Stale)
    }
}
