#![allow(dead_code)]

use dicom_slice_viewer::{
    config::ViewerConfig,
    directory::{DirectoryClient, DirectoryError, InstanceDirectory},
    enums::CachePolicy,
    instance::ImageId,
    slice_cache::{DecodeCache, DecodeError, DecodedSlice, SliceLoader},
    viewer::Viewer,
    voi::Voi,
};
use futures::future::BoxFuture;
use ndarray::Array2;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// In-memory instance directory keyed by series id.
#[derive(Default)]
pub struct MemoryDirectory {
    series: HashMap<String, Vec<Value>>,
}

impl MemoryDirectory {
    pub fn with_series(mut self, series_id: &str, numbers: &[i64]) -> Self {
        let records = numbers
            .iter()
            .enumerate()
            .map(|(i, number)| {
                json!({
                    "ID": format!("{series_id}-{i}"),
                    "instanceNumber": number,
                    "fileUrl": format!("{series_id}/{number}"),
                })
            })
            .collect();
        self.series.insert(series_id.to_owned(), records);
        self
    }

    pub fn with_records(mut self, series_id: &str, records: Vec<Value>) -> Self {
        self.series.insert(series_id.to_owned(), records);
        self
    }
}

impl InstanceDirectory for MemoryDirectory {
    fn fetch_instances(&self, series_id: &str) -> BoxFuture<'_, Result<Vec<Value>, DirectoryError>> {
        let result = self
            .series
            .get(series_id)
            .cloned()
            .ok_or_else(|| DirectoryError::Unavailable(format!("unknown series {series_id}")));
        Box::pin(async move { result })
    }
}

struct Stored {
    pixels: Array2<i32>,
    default_voi: Option<Voi>,
    delay: Duration,
}

/// In-memory loader keyed by file URL, counting loads per URL.
#[derive(Default)]
pub struct MemoryLoader {
    slices: HashMap<String, Stored>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryLoader {
    pub fn with_slice(mut self, url: &str, pixels: Array2<i32>) -> Self {
        self.slices.insert(
            url.to_owned(),
            Stored {
                pixels,
                default_voi: None,
                delay: Duration::ZERO,
            },
        );
        self
    }

    pub fn with_default_voi(mut self, url: &str, voi: Voi) -> Self {
        if let Some(stored) = self.slices.get_mut(url) {
            stored.default_voi = Some(voi);
        }
        self
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        if let Some(stored) = self.slices.get_mut(url) {
            stored.delay = delay;
        }
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl SliceLoader for MemoryLoader {
    fn load(&self, image_id: &ImageId) -> BoxFuture<'static, Result<DecodedSlice, DecodeError>> {
        let url = image_id.url().to_owned();
        *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;
        let stored = self.slices.get(&url).map(|stored| {
            (
                DecodedSlice::new(stored.pixels.clone()).with_default_voi(stored.default_voi),
                stored.delay,
            )
        });
        let image_id = image_id.to_string();
        Box::pin(async move {
            match stored {
                Some((slice, delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(slice)
                }
                None => Err(DecodeError::Fetch {
                    image_id,
                    reason: String::from("404"),
                }),
            }
        })
    }
}

pub fn uniform(value: i32) -> Array2<i32> {
    Array2::from_elem((4, 4), value)
}

/// 4x4 label slice: one quadrant per value, zeros elsewhere.
pub fn labelled(values: &[i32]) -> Array2<i32> {
    let mut pixels = Array2::zeros((4, 4));
    for (i, &value) in values.iter().enumerate() {
        pixels[[(i / 2) * 2, (i % 2) * 2]] = value;
    }
    pixels
}

pub fn viewer(directory: MemoryDirectory, loader: Arc<MemoryLoader>) -> Viewer {
    viewer_with_config(directory, loader, ViewerConfig::default())
}

pub fn viewer_with_config(
    directory: MemoryDirectory,
    loader: Arc<MemoryLoader>,
    config: ViewerConfig,
) -> Viewer {
    let cache = Arc::new(DecodeCache::new(loader, CachePolicy::Unbounded));
    Viewer::new(cache, DirectoryClient::new(Arc::new(directory)), config)
}
