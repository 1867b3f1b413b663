pub mod decode;
pub mod media;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;

use crate::{
    error::{DecodeError, FramixError, FramixResult},
    model::{Asset, AssetSource, Project},
};

/// Normalized assets keyed by the ids layers reference.
#[derive(Debug, Default, Clone)]
pub struct AssetStore {
    assets: BTreeMap<String, Asset>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, asset: Asset) {
        self.assets.insert(id.into(), asset);
    }

    /// Drop an asset and release its resources. Layers that still reference
    /// the id become dangling, which the compositor treats as no-op draws.
    pub fn remove(&mut self, id: &str) -> Option<Asset> {
        self.assets.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Asset> {
        self.assets.get(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }
}

/// Normalize and validate composition-relative asset paths.
///
/// The normalized result uses `/` separators, removes `.` segments, and
/// rejects absolute paths or parent traversals (`..`).
pub fn normalize_rel_path(source: &str) -> FramixResult<String> {
    let s = source.replace('\\', "/");
    if s.starts_with('/') {
        return Err(FramixError::validation("asset paths must be relative"));
    }
    if s.is_empty() {
        return Err(FramixError::validation("asset path must be non-empty"));
    }

    let mut out = Vec::<&str>::new();
    for part in s.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(FramixError::validation("asset paths must not contain '..'"));
        }
        out.push(part);
    }

    if out.is_empty() {
        return Err(FramixError::validation(
            "asset path must contain a file name",
        ));
    }

    Ok(out.join("/"))
}

/// Load and normalize every asset a project references, rooted at
/// `assets_root`. Fails on the first asset that cannot be normalized.
#[tracing::instrument(skip(project))]
pub fn load_project_assets(project: &Project, assets_root: &Path) -> FramixResult<AssetStore> {
    let mut store = AssetStore::new();
    for (id, source) in &project.assets {
        let rel = normalize_rel_path(source.source())?;
        let path = assets_root.join(&rel);
        let asset = normalize_source(source, &path)?;
        tracing::debug!(
            id = %id,
            source = %path.display(),
            width = asset.width(),
            height = asset.height(),
            "normalized asset"
        );
        store.insert(id.clone(), asset);
    }
    Ok(store)
}

fn normalize_source(source: &AssetSource, path: &Path) -> FramixResult<Asset> {
    match source {
        AssetSource::Still { .. } => {
            let bytes = read_bytes(path)?;
            Ok(Asset::Still(decode::decode_still(&bytes)?))
        }
        AssetSource::Animation { .. } => {
            let bytes = read_bytes(path)?;
            Ok(Asset::Frames(decode::decode_frame_sequence(&bytes)?))
        }
        AssetSource::Video { .. } => Ok(Asset::Video(media::open_video(path)?)),
    }
}

/// Normalize a single file, classified by extension. A one-frame GIF still
/// becomes a frame sequence; stills and animations stay distinct kinds.
pub fn normalize_file(path: &Path) -> FramixResult<Asset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "gif" => {
            let bytes = read_bytes(path)?;
            Ok(Asset::Frames(decode::decode_frame_sequence(&bytes)?))
        }
        "png" | "jpg" | "jpeg" | "bmp" | "webp" => {
            let bytes = read_bytes(path)?;
            Ok(Asset::Still(decode::decode_still(&bytes)?))
        }
        "mp4" | "mov" | "webm" | "mkv" | "avi" => Ok(Asset::Video(media::open_video(path)?)),
        other => Err(DecodeError::UnsupportedFormat(format!(
            "unrecognized extension '{other}' for '{}'",
            path.display()
        ))
        .into()),
    }
}

fn read_bytes(path: &Path) -> FramixResult<Vec<u8>> {
    Ok(std::fs::read(path).with_context(|| format!("read asset '{}'", path.display()))?)
}
