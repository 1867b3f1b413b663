pub mod animation;
pub mod capture;
pub mod quantize;
pub mod still;

use std::path::Path;

use crate::{
    error::FramixResult,
    model::{Background, CompositionSettings, ExportOptions},
};

pub(crate) const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Composition settings with per-export overrides applied. A `transparent:
/// false` override on a transparent composition falls back to compositing
/// over black.
pub fn effective_settings(
    settings: &CompositionSettings,
    options: &ExportOptions,
) -> CompositionSettings {
    let mut out = *settings;
    if let Some(w) = options.width {
        out.width = w;
    }
    if let Some(h) = options.height {
        out.height = h;
    }
    if let Some(fps) = options.fps {
        out.fps = fps;
    }
    if let Some(ms) = options.loop_duration_ms {
        out.loop_duration_ms = Some(ms);
    }
    if let Some(transparent) = options.transparent {
        out.background = match (transparent, out.background) {
            (true, _) => Background::Transparent,
            (false, Background::Transparent) => Background::Color {
                rgba: [0, 0, 0, 255],
            },
            (false, bg) => bg,
        };
    }
    out
}

pub fn ensure_parent_dir(path: &Path) -> FramixResult<()> {
    if let Some(parent) = path.parent() {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Background color an opaque sink flattens against.
pub(crate) fn flatten_color(settings: &CompositionSettings) -> [u8; 4] {
    settings.background.fill_rgba().unwrap_or([0, 0, 0, 255])
}
