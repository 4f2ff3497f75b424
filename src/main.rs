use std::{env, path::Path, sync::Arc};

use dicom_slice_viewer::{
    config::ViewerConfig,
    directory::{DirectoryClient, FsDirectory},
    instance::SeriesRef,
    slice_cache::{DecodeCache, DicomSliceLoader, FsFetcher},
    viewer::Viewer,
};

fn series_ref(path: &str) -> SeriesRef {
    let name = Path::new(path)
        .file_name()
        .map_or_else(|| path.to_owned(), |name| name.to_string_lossy().into_owned());
    SeriesRef::new(path, name)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let output = match args.last() {
        Some(last) if last.to_ascii_lowercase().ends_with(".png") => args.pop(),
        _ => None,
    }
    .unwrap_or_else(|| String::from("result.png"));
    let Some(series_dir) = args.first() else {
        eprintln!("usage: dicom-slice-viewer <series-dir> [overlay-dir] [out.png]");
        std::process::exit(2);
    };

    let config = ViewerConfig::default();
    let cache = Arc::new(DecodeCache::new(
        Arc::new(DicomSliceLoader::new(FsFetcher)),
        config.cache_policy,
    ));
    let directory = DirectoryClient::new(Arc::new(FsDirectory::new("")));
    let viewer = Viewer::new(cache, directory, config);

    viewer.select_series(Some(series_ref(series_dir))).await;
    if let Some(overlay_dir) = args.get(1) {
        viewer.select_overlay(Some(series_ref(overlay_dir))).await;
    }

    let count = viewer.snapshot().slice_count;
    viewer.show_slice(count / 2).await;

    let snapshot = viewer.snapshot();
    if let Some(error) = &snapshot.error {
        eprintln!("{error}");
    }
    for (value, label) in snapshot.labels.iter() {
        println!("{} = {value}", label.display_name);
    }

    viewer
        .composite()
        .save(&output)
        .expect("should have written composite image");
    viewer.shutdown();
}
