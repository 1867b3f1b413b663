#![forbid(unsafe_code)]

pub mod assets;
pub mod clock;
pub mod composite;
pub mod compositor;
pub mod error;
pub mod export;
pub mod model;
pub mod pixmap;
pub mod progress;

pub use assets::{load_project_assets, AssetStore};
pub use clock::{ExportTimeline, PlaybackState, TimelineClock};
pub use compositor::{Compositor, VideoSampling};
pub use error::{FramixError, FramixResult};
pub use export::animation::export_animation;
pub use export::capture::export_capture;
pub use export::still::{export_still, StillFormat};
pub use model::{
    Asset, AssetSource, Background, CompositionSettings, ExportOptions, Layer, LayerTransform,
    Project,
};
pub use pixmap::Pixmap;
pub use progress::{ExportProgress, ExportStage, ProgressCallback};
