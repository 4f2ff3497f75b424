//! Normalized instance descriptors.
//!
//! Upstream directories do not agree on the shape of an instance record: the
//! id, the instance number and the windowing tags can each live under several
//! field names or nested tag dictionaries. [`InstanceDescriptor::from_value`]
//! resolves all of them once at ingestion, so no other module probes raw
//! records.

use log::debug;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

const ID_KEYS: &[&str] = &["ID", "id", "Id", "instanceId", "SOPInstanceUID"];
const INSTANCE_NUMBER_KEYS: &[&str] = &["instanceNumber", "InstanceNumber"];
const TAG_CONTAINERS: &[&str] = &["MainDicomTags", "Tags", "tags"];
const URL_KEYS: &[&str] = &["fileUrl", "url", "FileUrl", "Path"];

const INSTANCE_NUMBER_TAG: &[&str] = &["InstanceNumber", "0020,0013", "00200013"];
const WINDOW_CENTER_TAG: &[&str] = &["WindowCenter", "0028,1050", "00281050"];
const WINDOW_WIDTH_TAG: &[&str] = &["WindowWidth", "0028,1051", "00281051"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesRef {
    pub id: String,
    pub name: String,
}

impl SeriesRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Opaque decoder key: `<decoder-scheme>:<instance-file-url>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(String);

impl ImageId {
    pub fn for_instance(scheme: &str, url: &str) -> Self {
        Self(format!("{scheme}:{url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the scheme prefix, i.e. the file URL.
    pub fn url(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, url)| url)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescriptor {
    pub id: String,
    pub instance_number: i64,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub file_url: Option<String>,
}

impl InstanceDescriptor {
    pub fn new(id: impl Into<String>, instance_number: i64) -> Self {
        Self {
            id: id.into(),
            instance_number,
            window_center: None,
            window_width: None,
            file_url: None,
        }
    }

    pub fn with_window(mut self, center: f64, width: f64) -> Self {
        self.window_center = Some(center);
        self.window_width = Some(width);
        self
    }

    pub fn with_file_url(mut self, url: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self
    }

    /// Normalize a raw directory record. `position` is the record's index in
    /// the listing and serves as instance number of last resort.
    ///
    /// Records without any usable id are dropped.
    pub fn from_value(raw: &Value, position: usize) -> Option<Self> {
        let Some(id) = first_string(raw, ID_KEYS) else {
            debug!("dropping instance record {position} without an id");
            return None;
        };

        let instance_number = first_number(raw, INSTANCE_NUMBER_KEYS)
            .or_else(|| tag_number(raw, INSTANCE_NUMBER_TAG))
            .or_else(|| raw.get("IndexInSeries").and_then(number_of))
            .map(|n| n as i64)
            .unwrap_or(position as i64);

        let window_center = first_number(raw, &["windowCenter"])
            .or_else(|| tag_number(raw, WINDOW_CENTER_TAG))
            .or_else(|| first_number(raw, &WINDOW_CENTER_TAG[..1]));
        let window_width = first_number(raw, &["windowWidth"])
            .or_else(|| tag_number(raw, WINDOW_WIDTH_TAG))
            .or_else(|| first_number(raw, &WINDOW_WIDTH_TAG[..1]));

        Some(Self {
            id,
            instance_number,
            window_center,
            window_width,
            file_url: first_string(raw, URL_KEYS),
        })
    }

    pub fn image_id(&self, scheme: &str) -> ImageId {
        ImageId::for_instance(scheme, self.file_url.as_deref().unwrap_or(&self.id))
    }
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match raw.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_number(raw: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| raw.get(*key).and_then(number_of))
}

fn tag_number(raw: &Value, tag_keys: &[&str]) -> Option<f64> {
    TAG_CONTAINERS
        .iter()
        .filter_map(|container| raw.get(*container))
        .find_map(|tags| first_number(tags, tag_keys))
}

/// Best-effort numeric value of a tag: plain numbers, numeric strings
/// (first backslash component of a multi-valued string), arrays and
/// DICOM JSON `{ "Value": [...] }` wrappers.
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.split('\\').next()?.trim().parse::<f64>().ok(),
        Value::Array(items) => items.first().and_then(number_of),
        Value::Object(map) => map.get("Value").and_then(number_of),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Ordered, immutable slices of one series. Index `0..len` is the slice index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceSet {
    instances: Arc<[InstanceDescriptor]>,
}

impl SliceSet {
    /// Stable sort by instance number; equal numbers keep listing order.
    pub fn from_unsorted(mut instances: Vec<InstanceDescriptor>) -> Self {
        instances.sort_by_key(|instance| instance.instance_number);
        Self {
            instances: instances.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&InstanceDescriptor> {
        self.instances.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceDescriptor> {
        self.instances.iter()
    }

    pub fn image_ids(&self, scheme: &str) -> Vec<ImageId> {
        self.iter().map(|instance| instance.image_id(scheme)).collect()
    }
}

/// Lookup of overlay slices by the instance number of the base slice.
#[derive(Debug, Clone, Default)]
pub struct OverlayIndex {
    by_number: HashMap<i64, InstanceDescriptor>,
}

impl OverlayIndex {
    pub fn build(slices: &SliceSet) -> Self {
        let mut by_number = HashMap::with_capacity(slices.len());
        for instance in slices.iter() {
            by_number
                .entry(instance.instance_number)
                .or_insert_with(|| instance.clone());
        }
        Self { by_number }
    }

    pub fn lookup(&self, instance_number: i64) -> Option<&InstanceDescriptor> {
        self.by_number.get(&instance_number)
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}
