use std::collections::BTreeMap;

use kurbo::Affine;

use crate::{
    assets::media::VideoSourceInfo,
    error::{DecodeError, FramixError, FramixResult},
    pixmap::Pixmap,
};

/// Scale factors below this are clamped up to avoid degenerate/inverted
/// geometry.
pub const MIN_SCALE: f64 = 0.1;

/// Fallback loop duration when "auto" resolution finds no animated asset.
pub const DEFAULT_LOOP_MS: f64 = 5000.0;

/// A normalized, time-sampleable visual source. The set is closed; the
/// compositor matches exhaustively.
#[derive(Clone, Debug)]
pub enum Asset {
    Still(StillAsset),
    Frames(FrameSequenceAsset),
    Video(VideoAsset),
}

impl Asset {
    pub fn width(&self) -> u32 {
        match self {
            Asset::Still(a) => a.bitmap.width(),
            Asset::Frames(a) => a.width,
            Asset::Video(a) => a.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Asset::Still(a) => a.bitmap.height(),
            Asset::Frames(a) => a.height,
            Asset::Video(a) => a.height,
        }
    }

    /// Loop length for animated kinds; `None` for stills.
    pub fn animated_duration_ms(&self) -> Option<f64> {
        match self {
            Asset::Still(_) => None,
            Asset::Frames(a) => Some(a.total_duration_ms as f64),
            Asset::Video(a) => Some(a.duration_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StillAsset {
    pub bitmap: Pixmap,
}

#[derive(Clone, Debug)]
pub struct SeqFrame {
    pub bitmap: Pixmap,
    pub duration_ms: u64,
}

/// Decoded palette animation: full-canvas frame snapshots with per-frame
/// durations. Frames are not deltas; disposal handling happens at decode.
#[derive(Clone, Debug)]
pub struct FrameSequenceAsset {
    pub width: u32,
    pub height: u32,
    frames: Vec<SeqFrame>,
    total_duration_ms: u64,
    pub loop_count: Option<u16>,
}

/// Frames shorter than this are stretched to it, so a malformed source cannot
/// force runaway playback.
pub const MIN_FRAME_DURATION_MS: u64 = 10;

impl FrameSequenceAsset {
    /// Build a sequence, clamping per-frame durations to
    /// [`MIN_FRAME_DURATION_MS`] and deriving the total.
    pub fn new(
        width: u32,
        height: u32,
        frames: Vec<SeqFrame>,
        loop_count: Option<u16>,
    ) -> FramixResult<Self> {
        if frames.is_empty() {
            return Err(DecodeError::NoFrames.into());
        }
        let mut clamped = frames;
        for f in &mut clamped {
            if f.bitmap.width() != width || f.bitmap.height() != height {
                return Err(FramixError::validation(format!(
                    "sequence frame is {}x{}, expected {width}x{height}",
                    f.bitmap.width(),
                    f.bitmap.height()
                )));
            }
            f.duration_ms = f.duration_ms.max(MIN_FRAME_DURATION_MS);
        }
        let total_duration_ms = clamped.iter().map(|f| f.duration_ms).sum();
        Ok(Self {
            width,
            height,
            frames: clamped,
            total_duration_ms,
            loop_count,
        })
    }

    pub fn frames(&self) -> &[SeqFrame] {
        &self.frames
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    /// Frame selected at `time_ms`, wrapping at the total duration.
    ///
    /// Cumulative scan in stored order; frame `i` covers
    /// `[Σ d(0..i), Σ d(0..=i))`. A zero total selects frame 0 without
    /// dividing.
    pub fn frame_index_at(&self, time_ms: f64) -> usize {
        if self.total_duration_ms == 0 {
            return 0;
        }
        let loop_time = time_ms.max(0.0) % (self.total_duration_ms as f64);
        let mut acc = 0u64;
        for (i, f) in self.frames.iter().enumerate() {
            acc += f.duration_ms;
            if loop_time < acc as f64 {
                return i;
            }
        }
        self.frames.len() - 1
    }

    pub fn bitmap_at(&self, time_ms: f64) -> &Pixmap {
        &self.frames[self.frame_index_at(time_ms)].bitmap
    }
}

/// A seekable video source. The asset itself is immutable; the playback
/// position lives in the pooled [`crate::assets::media::VideoHandle`], which
/// is a single-writer resource.
#[derive(Clone, Debug)]
pub struct VideoAsset {
    pub width: u32,
    pub height: u32,
    pub duration_ms: f64,
    pub source: VideoSourceInfo,
}

impl VideoAsset {
    /// Rejects unusable durations up front. The compositor relies on this
    /// boundary absolutely and never re-checks.
    pub fn new(
        width: u32,
        height: u32,
        duration_ms: f64,
        source: VideoSourceInfo,
    ) -> FramixResult<Self> {
        if !duration_ms.is_finite() || duration_ms <= 0.0 {
            return Err(DecodeError::InvalidDuration(duration_ms).into());
        }
        Ok(Self {
            width,
            height,
            duration_ms,
            source,
        })
    }
}

/// Placement of one asset in the composition. Translation is the point the
/// asset is centered on; rotation and scale are relative to that center.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LayerTransform {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "one")]
    pub scale_x: f64,
    #[serde(default = "one")]
    pub scale_y: f64,
    #[serde(default)]
    pub rotation_deg: f64,
    #[serde(default = "one")]
    pub opacity: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation_deg: 0.0,
            opacity: 1.0,
        }
    }
}

impl LayerTransform {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.set_opacity(opacity);
        self
    }

    pub fn with_scale(mut self, scale_x: f64, scale_y: f64) -> Self {
        self.set_scale(scale_x, scale_y);
        self
    }

    pub fn with_rotation_deg(mut self, deg: f64) -> Self {
        self.rotation_deg = deg;
        self
    }

    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn set_scale(&mut self, scale_x: f64, scale_y: f64) {
        self.scale_x = scale_x.max(MIN_SCALE);
        self.scale_y = scale_y.max(MIN_SCALE);
    }

    /// Canonicalized copy with every field inside its bounds. Applied by the
    /// compositor so deserialized documents obey the same clamps as the
    /// mutators.
    pub fn clamped(&self) -> Self {
        Self {
            x: self.x,
            y: self.y,
            scale_x: self.scale_x.max(MIN_SCALE),
            scale_y: self.scale_y.max(MIN_SCALE),
            rotation_deg: self.rotation_deg,
            opacity: self.opacity.clamp(0.0, 1.0),
        }
    }

    /// Local-to-composition affine for an asset of the given size. Order is
    /// translate, rotate, scale; the asset is drawn centered, so local space
    /// starts at `(-w/2, -h/2)`.
    pub fn to_affine(&self, asset_w: f64, asset_h: f64) -> Affine {
        Affine::translate((self.x, self.y))
            * Affine::rotate(self.rotation_deg.to_radians())
            * Affine::scale_non_uniform(self.scale_x, self.scale_y)
            * Affine::translate((-asset_w / 2.0, -asset_h / 2.0))
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.scale_x.is_finite()
            && self.scale_y.is_finite()
            && self.rotation_deg.is_finite()
            && self.opacity.is_finite()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
}

/// One entry in the z-ordered layer list: index 0 is back-most.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Layer {
    pub id: String,
    /// Key into the asset table. A dangling key is a tolerated no-op draw.
    pub asset: String,
    #[serde(default)]
    pub transform: LayerTransform,
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Editing-only; the compositor ignores it.
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub blend: BlendMode,
}

fn default_true() -> bool {
    true
}

impl Layer {
    pub fn new(id: impl Into<String>, asset: impl Into<String>, transform: LayerTransform) -> Self {
        Self {
            id: id.into(),
            asset: asset.into(),
            transform,
            visible: true,
            locked: false,
            blend: BlendMode::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Background {
    #[default]
    Transparent,
    Color {
        rgba: [u8; 4],
    },
}

impl Background {
    pub fn fill_rgba(&self) -> Option<[u8; 4]> {
        match self {
            Background::Transparent => None,
            Background::Color { rgba } => Some(*rgba),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompositionSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// `None` means "auto": derive from the longest animated asset referenced
    /// by any layer, falling back to [`DEFAULT_LOOP_MS`].
    #[serde(default)]
    pub loop_duration_ms: Option<f64>,
    #[serde(default)]
    pub background: Background,
}

/// Optional per-export overrides; unset fields fall back to
/// [`CompositionSettings`] or format-specific defaults.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ExportOptions {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// 1..=100; JPEG only (default 92).
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub transparent: Option<bool>,
    #[serde(default)]
    pub loop_duration_ms: Option<f64>,
}

/// Document-side reference to a media file, relative to the project root.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum AssetSource {
    Still { source: String },
    Animation { source: String },
    Video { source: String },
}

impl AssetSource {
    pub fn source(&self) -> &str {
        match self {
            AssetSource::Still { source }
            | AssetSource::Animation { source }
            | AssetSource::Video { source } => source,
        }
    }
}

/// The project document the CLI loads and the exporters consume.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Project {
    pub settings: CompositionSettings,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub assets: BTreeMap<String, AssetSource>,
}

impl Project {
    /// Structural validation. Dangling asset references are deliberately NOT
    /// rejected; the compositor treats them as no-op draws.
    pub fn validate(&self) -> FramixResult<()> {
        if self.settings.width == 0 || self.settings.height == 0 {
            return Err(FramixError::validation(
                "composition width/height must be > 0",
            ));
        }
        if !self.settings.fps.is_finite() || self.settings.fps <= 0.0 {
            return Err(FramixError::validation("fps must be finite and > 0"));
        }
        if let Some(ms) = self.settings.loop_duration_ms
            && (!ms.is_finite() || ms <= 0.0)
        {
            return Err(FramixError::validation(
                "loop_duration_ms must be finite and > 0 when set",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for layer in &self.layers {
            if layer.id.trim().is_empty() {
                return Err(FramixError::validation("layer id must be non-empty"));
            }
            if !seen.insert(layer.id.as_str()) {
                return Err(FramixError::validation(format!(
                    "duplicate layer id '{}'",
                    layer.id
                )));
            }
            if !layer.transform.is_finite() {
                return Err(FramixError::validation(format!(
                    "layer '{}' has a non-finite transform",
                    layer.id
                )));
            }
        }

        Ok(())
    }
}
