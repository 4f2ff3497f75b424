//! Label discovery and per-label display configuration.
//!
//! Discovery is sampling based: each overlay slice is sampled with a stride
//! chosen so that roughly `label_sample_target` pixels are inspected, and the
//! scan stops once `label_cap` distinct values were found. Small structures
//! can be missed, so the result is approximate rather than exhaustive.

use crate::{
    config::ViewerConfig,
    enums::Outcome,
    instance::SliceSet,
    slice_cache::DecodeCache,
    token::CancellationToken,
};

use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub type LabelValue = i32;

pub type Rgb = [u8; 3];

/// Default colors, assigned by rank and cycled.
pub const PALETTE: [Rgb; 10] = [
    [230, 25, 75],
    [60, 180, 75],
    [0, 130, 200],
    [255, 225, 25],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
];

#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfig {
    pub enabled: bool,
    pub color: Rgb,
    pub opacity: f32,
    pub display_name: String,
}

/// Display configuration of every discovered label, keyed by raw value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelTable {
    labels: BTreeMap<LabelValue, LabelConfig>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: LabelValue) -> Option<&LabelConfig> {
        self.labels.get(&value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LabelValue, &LabelConfig)> {
        self.labels.iter().map(|(value, config)| (*value, config))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    /// Add defaults for values not configured yet. Existing entries, including
    /// user edits and names, are left untouched.
    ///
    /// A new value is named after its 1-based rank among `discovered` (sorted
    /// ascending). If that name already belongs to another label, the lowest
    /// free `L<n>` is used instead. Returns the number of labels added.
    pub fn merge_discovered(&mut self, discovered: &[LabelValue], config: &ViewerConfig) -> usize {
        let ranked: BTreeSet<LabelValue> = discovered.iter().copied().collect();
        let mut taken: HashSet<String> = self
            .labels
            .values()
            .map(|label| label.display_name.clone())
            .collect();

        let mut added = 0;
        for (rank, value) in ranked.into_iter().enumerate() {
            if self.labels.contains_key(&value) {
                continue;
            }
            let mut name = format!("L{}", rank + 1);
            let mut n = 1;
            while taken.contains(&name) {
                name = format!("L{n}");
                n += 1;
            }
            taken.insert(name.clone());
            self.labels.insert(
                value,
                LabelConfig {
                    enabled: true,
                    color: PALETTE[rank % PALETTE.len()],
                    opacity: config.default_label_opacity.clamp(0.0, 1.0),
                    display_name: name,
                },
            );
            added += 1;
        }
        added
    }

    fn edit(&mut self, value: LabelValue, apply: impl FnOnce(&mut LabelConfig)) -> bool {
        let Some(label) = self.labels.get_mut(&value) else {
            return false;
        };
        let before = label.clone();
        apply(label);
        *label != before
    }

    /// Each setter reports whether the table changed.
    pub fn set_enabled(&mut self, value: LabelValue, enabled: bool) -> bool {
        self.edit(value, |label| label.enabled = enabled)
    }

    pub fn set_color(&mut self, value: LabelValue, color: Rgb) -> bool {
        self.edit(value, |label| label.color = color)
    }

    pub fn set_opacity(&mut self, value: LabelValue, opacity: f32) -> bool {
        let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
        self.edit(value, |label| label.opacity = opacity)
    }

    pub fn set_display_name(&mut self, value: LabelValue, name: impl Into<String>) -> bool {
        let name = name.into();
        self.edit(value, |label| label.display_name = name)
    }
}

/// Sample one slice into `found`. Returns `true` once the cap is reached.
pub fn sample_distinct(
    samples: &[LabelValue],
    sample_target: usize,
    found: &mut BTreeSet<LabelValue>,
    cap: usize,
) -> bool {
    let stride = (samples.len() / sample_target.max(1)).max(1);
    for &value in samples.iter().step_by(stride) {
        if value != 0 && found.insert(value) && found.len() >= cap {
            return true;
        }
    }
    found.len() >= cap
}

/// Discover the distinct non-zero values of an overlay series, ascending.
///
/// Slices are scanned in slice order; slices that fail to decode are skipped.
/// Returns [`Outcome::Stale`] if `token` dies while the scan is suspended.
pub async fn discover_labels(
    cache: &DecodeCache,
    slices: &SliceSet,
    token: &CancellationToken,
    config: &ViewerConfig,
) -> Outcome<Vec<LabelValue>> {
    let mut found = BTreeSet::new();
    let mut scanned = 0;

    for image_id in slices.image_ids(&config.decoder_scheme) {
        let decoded = cache.decode(&image_id).await;
        if token.is_cancelled() {
            trace!("label scan superseded after {scanned} slices");
            return Outcome::Stale;
        }
        scanned += 1;
        match decoded {
            Ok(slice) => {
                if sample_distinct(slice.samples(), config.label_sample_target, &mut found, config.label_cap) {
                    debug!("label cap of {} reached after {scanned} slices", config.label_cap);
                    break;
                }
            }
            Err(err) => warn!("skipping overlay slice during label scan: {err}"),
        }
    }

    debug!("label scan found {} values in {scanned} slices", found.len());
    Outcome::Committed(found.into_iter().collect())
}
