//! # DICOM slice viewer
//!
//! Core of a 2-D DICOM slice viewer with segmentation overlays.
//!
//! A [`Viewer`](viewer::Viewer) resolves a series to its ordered instances,
//! decodes slices through a shared [`DecodeCache`](slice_cache::DecodeCache)
//! and paints them with a pan/zoom/rotate/flip viewport. An optional overlay
//! series holds a label volume. Its distinct label values are discovered by
//! sampling and drawn as a colorized layer that uses exactly the base image's
//! draw transform, so the two layers stay registered.
//!
//!  - Slices are ordered by instance number, with a stable sort
//!  - Overlay slices are matched to base slices by instance number
//!  - The remaining slices of a series are prefetched in background batches
//!  - Every asynchronous step is cancellable, and only the latest request commits
//!
//! Pixel data is decoded with dicom-rs. Stored values are kept raw, so label
//! values compare exactly and window center/width is applied by the viewer.
//!
//! # Examples
//!
//! ## Showing a local series with an overlay
//!
//! ```no_run
//! # use dicom_slice_viewer::{config::ViewerConfig, directory::{DirectoryClient, FsDirectory},
//! #     instance::SeriesRef, slice_cache::{DecodeCache, DicomSliceLoader, FsFetcher}, viewer::Viewer};
//! # use std::sync::Arc;
//! # async fn run() {
//! let config = ViewerConfig::default();
//! let cache = Arc::new(DecodeCache::new(
//!     Arc::new(DicomSliceLoader::new(FsFetcher)),
//!     config.cache_policy,
//! ));
//! let directory = DirectoryClient::new(Arc::new(FsDirectory::new("studies")));
//! let viewer = Viewer::new(cache, directory, config);
//!
//! viewer.select_series(Some(SeriesRef::new("ct", "CT"))).await;
//! viewer.select_overlay(Some(SeriesRef::new("seg", "Segmentation"))).await;
//! viewer.update_viewport(|viewport| viewport.rotate_by(90.0)).await;
//! viewer.composite().save("result.png").expect("should have written image");
//! # }
//! ```

pub mod compositor;
pub mod config;
pub mod directory;
pub mod enums;
pub mod instance;
pub mod labels;
pub mod playback;
pub mod prefetch;
pub mod slice_cache;
pub mod token;
pub mod viewer;
pub mod viewport;
pub mod voi;
