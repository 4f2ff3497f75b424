use crate::instance::{InstanceDescriptor, SliceSet};

use dicom::object::OpenFileOptions;
use dicom_dictionary_std::tags;
use futures::future::BoxFuture;
use log::{debug, error};
use serde_json::{Map, Value, json};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Instance directory unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed instance listing: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// External service resolving a series id to its raw instance records.
pub trait InstanceDirectory: Send + Sync {
    fn fetch_instances(&self, series_id: &str) -> BoxFuture<'_, Result<Vec<Value>, DirectoryError>>;
}

/// Result of a listing. A failed listing still yields a (empty) slice set.
#[derive(Debug, Default)]
pub struct SliceListing {
    pub slices: SliceSet,
    pub error: Option<DirectoryError>,
}

#[derive(Clone)]
pub struct DirectoryClient {
    directory: Arc<dyn InstanceDirectory>,
    file_url_template: Option<String>,
}

impl DirectoryClient {
    pub fn new(directory: Arc<dyn InstanceDirectory>) -> Self {
        Self {
            directory,
            file_url_template: None,
        }
    }

    /// Template for instances whose record carries no file URL; `{id}` is
    /// replaced with the instance id.
    pub fn with_file_url_template(mut self, template: impl Into<String>) -> Self {
        self.file_url_template = Some(template.into());
        self
    }

    /// List the instances of a series, ordered by instance number.
    ///
    /// Never fails: errors are reported next to an empty slice set.
    pub async fn list_instances(&self, series_id: &str) -> SliceListing {
        let records = match self.directory.fetch_instances(series_id).await {
            Ok(records) => records,
            Err(err) => {
                error!("listing instances of series {series_id} failed: {err}");
                return SliceListing {
                    slices: SliceSet::default(),
                    error: Some(err),
                };
            }
        };

        let mut seen = HashSet::new();
        let instances: Vec<_> = records
            .iter()
            .enumerate()
            .filter_map(|(position, raw)| InstanceDescriptor::from_value(raw, position))
            .filter(|instance| seen.insert(instance.id.clone()))
            .map(|mut instance| {
                if instance.file_url.is_none() {
                    instance.file_url = self
                        .file_url_template
                        .as_ref()
                        .map(|template| template.replace("{id}", &instance.id));
                }
                instance
            })
            .collect();

        debug!(
            "series {series_id}: {} of {} records usable",
            instances.len(),
            records.len()
        );

        let error = (instances.is_empty() && !records.is_empty()).then(|| {
            error!("series {series_id}: no instance record carries an id");
            DirectoryError::Malformed(format!("{} records without instance ids", records.len()))
        });
        SliceListing {
            slices: SliceSet::from_unsorted(instances),
            error,
        }
    }
}

/// Directory backed by local folders: a series id names a folder of `.dcm` files.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn list_folder(folder: &Path) -> Result<Vec<Value>, DirectoryError> {
        let mut paths: Vec<_> = fs::read_dir(folder)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        paths.sort();

        paths.iter().map(|path| Self::record_for_file(path)).collect()
    }

    fn record_for_file(path: &Path) -> Result<Value, DirectoryError> {
        // Header tags only; the pixel payload is never needed here
        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)?;
        let mut tags_map = Map::new();

        if let Some(number) = object
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
        {
            tags_map.insert("InstanceNumber".into(), json!(number));
        }
        for (key, tag) in [
            ("WindowCenter", tags::WINDOW_CENTER),
            ("WindowWidth", tags::WINDOW_WIDTH),
        ] {
            if let Some(value) = object.element(tag).ok().and_then(|e| e.to_str().ok()) {
                tags_map.insert(key.into(), json!(value.trim_end_matches('\0').trim()));
            }
        }

        let location = path.to_string_lossy();
        Ok(json!({
            "ID": location,
            "fileUrl": format!("file://{location}"),
            "MainDicomTags": Value::Object(tags_map),
        }))
    }
}

impl InstanceDirectory for FsDirectory {
    fn fetch_instances(&self, series_id: &str) -> BoxFuture<'_, Result<Vec<Value>, DirectoryError>> {
        let folder = self.root.join(series_id);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::list_folder(&folder))
                .await
                .map_err(|err| DirectoryError::Unavailable(err.to_string()))?
        })
    }
}
