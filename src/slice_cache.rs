//! Decoded slice cache.
//!
//! Pixel data is addressed by [`ImageId`]. Concurrent requests for the same id
//! share a single in-flight load, and completed slices are served from memory
//! for the rest of the session unless a bounded [`CachePolicy`] evicts them.

use crate::{enums::CachePolicy, instance::ImageId, voi::Voi};

use dicom::{
    core::Tag,
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use log::{debug, warn};
use ndarray::{Array2, s};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Failed to fetch {image_id}: {reason}")]
    Fetch { image_id: String, reason: String },

    #[error("Failed to decode {image_id}: {reason}")]
    Decode { image_id: String, reason: String },

    #[error("No pixel data in {0}")]
    NoPixelData(String),
}

/// Modality rescale (`stored * slope + intercept`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Rescale {
    #[inline]
    pub fn apply(&self, stored: i32) -> f64 {
        f64::from(stored).mul_add(self.slope, self.intercept)
    }
}

/// Raw stored values of one slice in image space (rows x columns), widened to
/// `i32` so signed and unsigned pixel representations share one type.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSlice {
    pixels: Array2<i32>,
    rescale: Rescale,
    default_voi: Option<Voi>,
}

impl DecodedSlice {
    pub fn new(pixels: Array2<i32>) -> Self {
        Self {
            pixels: pixels.as_standard_layout().into_owned(),
            rescale: Rescale::default(),
            default_voi: None,
        }
    }

    pub fn with_rescale(mut self, rescale: Rescale) -> Self {
        self.rescale = rescale;
        self
    }

    pub fn with_default_voi(mut self, voi: Option<Voi>) -> Self {
        self.default_voi = voi;
        self
    }

    pub fn rows(&self) -> u32 {
        self.pixels.dim().0 as u32
    }

    pub fn columns(&self) -> u32 {
        self.pixels.dim().1 as u32
    }

    pub fn pixels(&self) -> &Array2<i32> {
        &self.pixels
    }

    /// Row-major stored values.
    pub fn samples(&self) -> &[i32] {
        self.pixels.as_slice().unwrap_or_default()
    }

    pub fn rescale(&self) -> Rescale {
        self.rescale
    }

    pub fn default_voi(&self) -> Option<Voi> {
        self.default_voi
    }
}

/// Produces decoded slices for image ids. The external decode library sits behind this.
pub trait SliceLoader: Send + Sync {
    fn load(&self, image_id: &ImageId) -> BoxFuture<'static, Result<DecodedSlice, DecodeError>>;
}

/// Retrieves the raw bytes behind an instance file URL.
pub trait ByteFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> BoxFuture<'static, io::Result<Vec<u8>>>;
}

/// Reads `file://` URLs (or plain paths) from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsFetcher;

impl ByteFetcher for FsFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        let path = url.strip_prefix("file://").unwrap_or(url).to_owned();
        Box::pin(async move { tokio::fs::read(path).await })
    }
}

/// Decodes DICOM part-10 bytes with the dicom-rs pixel data pipeline.
pub struct DicomSliceLoader<F> {
    fetcher: Arc<F>,
}

impl<F: ByteFetcher> DicomSliceLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
        }
    }

    fn decode_bytes(image_id: &str, bytes: &[u8]) -> Result<DecodedSlice, DecodeError> {
        let decode_err = |reason: String| DecodeError::Decode {
            image_id: image_id.to_owned(),
            reason,
        };

        // from_reader expects the stream to start at the DICM magic code
        let body = match bytes.get(128..132) {
            Some(magic) if magic == b"DICM" => &bytes[128..],
            _ => bytes,
        };
        let object = dicom::object::from_reader(body).map_err(|err| decode_err(err.to_string()))?;

        if object.element(tags::PIXEL_DATA).is_err() {
            return Err(DecodeError::NoPixelData(image_id.to_owned()));
        }
        let pixel_data = object
            .decode_pixel_data()
            .map_err(|err| decode_err(err.to_string()))?;

        // Stored values only: labels are compared by raw value and windowing is ours.
        // i32 holds both unsigned and two's complement 16-bit samples.
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::None)
            .with_voi_lut(VoiLutOption::Identity);
        let pixels = pixel_data
            .to_ndarray_with_options::<i32>(&options)
            .map_err(|err| decode_err(err.to_string()))?
            .slice_move(s![0, .., .., 0]);

        let float_of = |tag: Tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_multi_float32().ok())
                .and_then(|values| values.first().map(|&v| f64::from(v)))
        };
        let rescale = Rescale {
            slope: float_of(tags::RESCALE_SLOPE).unwrap_or(1.0),
            intercept: float_of(tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        };
        let default_voi = Voi::from_tags(float_of(tags::WINDOW_CENTER), float_of(tags::WINDOW_WIDTH));

        Ok(DecodedSlice::new(pixels)
            .with_rescale(rescale)
            .with_default_voi(default_voi))
    }
}

impl<F: ByteFetcher> SliceLoader for DicomSliceLoader<F> {
    fn load(&self, image_id: &ImageId) -> BoxFuture<'static, Result<DecodedSlice, DecodeError>> {
        let fetcher = Arc::clone(&self.fetcher);
        let image_id = image_id.clone();
        Box::pin(async move {
            let bytes = fetcher
                .fetch(image_id.url())
                .await
                .map_err(|err| DecodeError::Fetch {
                    image_id: image_id.to_string(),
                    reason: err.to_string(),
                })?;
            let id = image_id.to_string();
            tokio::task::spawn_blocking(move || Self::decode_bytes(&id, &bytes))
                .await
                .map_err(|err| DecodeError::Decode {
                    image_id: image_id.to_string(),
                    reason: err.to_string(),
                })?
        })
    }
}

type SharedDecode = Shared<BoxFuture<'static, Result<Arc<DecodedSlice>, DecodeError>>>;

enum Entry {
    Pending(SharedDecode),
    Ready {
        slice: Arc<DecodedSlice>,
        /// Access stamp, only advanced under a bounded policy.
        last_used: u64,
    },
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ImageId, Entry>,
    ready: usize,
    clock: u64,
    loads_started: usize,
}

impl CacheState {
    fn ready(&mut self, image_id: &ImageId, policy: CachePolicy) -> Option<Arc<DecodedSlice>> {
        let stamp = self.stamp(policy);
        match self.entries.get_mut(image_id)? {
            Entry::Ready { slice, last_used } => {
                *last_used = stamp;
                Some(Arc::clone(slice))
            }
            Entry::Pending(_) => None,
        }
    }

    fn pending(&self, image_id: &ImageId) -> Option<SharedDecode> {
        match self.entries.get(image_id)? {
            Entry::Pending(shared) => Some(shared.clone()),
            Entry::Ready { .. } => None,
        }
    }

    fn is_same_pending(&self, image_id: &ImageId, load: &SharedDecode) -> bool {
        matches!(self.entries.get(image_id), Some(Entry::Pending(p)) if p.ptr_eq(load))
    }

    fn stamp(&mut self, policy: CachePolicy) -> u64 {
        if let CachePolicy::MaxEntries(_) = policy {
            self.clock += 1;
        }
        self.clock
    }

    fn commit(&mut self, image_id: &ImageId, slice: Arc<DecodedSlice>, policy: CachePolicy) {
        let last_used = self.stamp(policy);
        self.entries
            .insert(image_id.clone(), Entry::Ready { slice, last_used });
        self.ready += 1;
        self.evict(policy);
    }

    fn evict(&mut self, policy: CachePolicy) {
        let CachePolicy::MaxEntries(max) = policy else {
            return;
        };
        while self.ready > max {
            let oldest = self
                .entries
                .iter()
                .filter_map(|(id, entry)| match entry {
                    Entry::Ready { last_used, .. } => Some((*last_used, id)),
                    Entry::Pending(_) => None,
                })
                .min_by_key(|(last_used, _)| *last_used)
                .map(|(_, id)| id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            debug!("evicting {oldest} from decode cache");
            self.entries.remove(&oldest);
            self.ready -= 1;
        }
    }
}

/// Process-wide decode cache, shared by base display, overlay draw, label
/// scan and prefetch.
pub struct DecodeCache {
    loader: Arc<dyn SliceLoader>,
    policy: CachePolicy,
    state: Mutex<CacheState>,
}

impl DecodeCache {
    pub fn new(loader: Arc<dyn SliceLoader>, policy: CachePolicy) -> Self {
        Self {
            loader,
            policy,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // No code path panics while holding the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode a slice, serving completed and in-flight loads from the cache.
    pub async fn decode(&self, image_id: &ImageId) -> Result<Arc<DecodedSlice>, DecodeError> {
        let load = {
            let mut state = self.lock();
            if let Some(slice) = state.ready(image_id, self.policy) {
                debug!("decode cache hit for {image_id}");
                return Ok(slice);
            }
            match state.pending(image_id) {
                Some(load) => load,
                None => {
                    debug!("decode cache miss for {image_id}");
                    let load = self
                        .loader
                        .load(image_id)
                        .map(|result| result.map(Arc::new))
                        .boxed()
                        .shared();
                    state
                        .entries
                        .insert(image_id.clone(), Entry::Pending(load.clone()));
                    state.loads_started += 1;
                    load
                }
            }
        };

        let result = load.clone().await;

        let mut state = self.lock();
        if state.is_same_pending(image_id, &load) {
            match &result {
                Ok(slice) => state.commit(image_id, Arc::clone(slice), self.policy),
                Err(err) => {
                    warn!("{err}");
                    state.entries.remove(image_id);
                }
            }
        }
        result
    }

    pub fn contains(&self, image_id: &ImageId) -> bool {
        matches!(self.lock().entries.get(image_id), Some(Entry::Ready { .. }))
    }

    /// Number of completed slices held.
    pub fn len(&self) -> usize {
        self.lock().ready
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many loads were handed to the loader so far.
    pub fn loads_started(&self) -> usize {
        self.lock().loads_started
    }
}
