use std::path::Path;

use anyhow::Context;
use image::ImageEncoder as _;

use crate::{
    assets::AssetStore,
    composite::flatten_to_opaque_rgba8,
    compositor::{Compositor, VideoSampling},
    error::{EncodeError, FramixResult},
    export::{effective_settings, flatten_color, DEFAULT_JPEG_QUALITY},
    model::{ExportOptions, Project},
    progress::{ExportStage, ProgressCallback, ProgressSink},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StillFormat {
    Png,
    Jpeg,
}

impl StillFormat {
    pub fn from_path(path: &Path) -> FramixResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => Ok(StillFormat::Png),
            "jpg" | "jpeg" => Ok(StillFormat::Jpeg),
            other => Err(EncodeError::UnsupportedCodec(format!(
                "no still encoder for '.{other}'"
            ))
            .into()),
        }
    }
}

/// Render the composition at `time_ms` and encode it as a still image,
/// returning the container bytes. Saving them is the caller's concern.
///
/// PNG keeps the alpha channel (straight alpha, per the format); JPEG
/// flattens against the background color, black when the composition is
/// transparent.
#[tracing::instrument(skip(project, assets, compositor, options, progress))]
pub fn export_still(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    time_ms: f64,
    format: StillFormat,
    options: &ExportOptions,
    progress: Option<ProgressCallback>,
) -> FramixResult<Vec<u8>> {
    let sink = ProgressSink::new(progress);
    let result = still_bytes(project, assets, compositor, time_ms, format, options, &sink);
    if let Err(err) = &result {
        sink.failed(err.to_string());
    }
    result
}

fn still_bytes(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    time_ms: f64,
    format: StillFormat,
    options: &ExportOptions,
    sink: &ProgressSink,
) -> FramixResult<Vec<u8>> {
    project.validate()?;
    let settings = effective_settings(&project.settings, options);
    if settings.width == 0 || settings.height == 0 {
        return Err(EncodeError::NoContext("export surface would be zero-sized".into()).into());
    }

    sink.stage(
        ExportStage::Preparing,
        0,
        format!("rendering still at {time_ms:.1}ms"),
    );
    let frame = compositor.render_frame(
        &settings,
        &project.layers,
        assets,
        time_ms,
        VideoSampling::Blocking,
    )?;
    compositor.finish();

    sink.stage(ExportStage::Encoding, 50, "encoding still");
    let mut bytes = Vec::new();
    match format {
        StillFormat::Png => {
            let straight = frame.to_straight_rgba8();
            image::codecs::png::PngEncoder::new(&mut bytes)
                .write_image(
                    &straight,
                    frame.width(),
                    frame.height(),
                    image::ExtendedColorType::Rgba8,
                )
                .context("encode png")?;
        }
        StillFormat::Jpeg => {
            let mut flat = vec![0u8; frame.data().len()];
            flatten_to_opaque_rgba8(&mut flat, frame.data(), flatten_color(&settings))?;
            let rgb: Vec<u8> = flat
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect();

            let quality = options
                .quality
                .unwrap_or(DEFAULT_JPEG_QUALITY)
                .clamp(1, 100);
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality);
            encoder
                .encode(
                    &rgb,
                    frame.width(),
                    frame.height(),
                    image::ExtendedColorType::Rgb8,
                )
                .context("encode jpeg")?;
        }
    }
    if bytes.is_empty() {
        return Err(
            EncodeError::SerializationFailed("still encoder produced no data".into()).into(),
        );
    }

    sink.complete(format!("encoded {} bytes", bytes.len()));
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AssetSource, Background, CompositionSettings, Layer, LayerTransform, StillAsset,
    };
    use crate::pixmap::Pixmap;

    fn red_project(background: Background) -> (Project, AssetStore) {
        let mut assets_doc = std::collections::BTreeMap::new();
        assets_doc.insert(
            "red".to_string(),
            AssetSource::Still {
                source: "red.png".to_string(),
            },
        );
        let project = Project {
            settings: CompositionSettings {
                width: 4,
                height: 4,
                fps: 30.0,
                loop_duration_ms: None,
                background,
            },
            layers: vec![Layer::new("l0", "red", LayerTransform::at(2.0, 2.0))],
            assets: assets_doc,
        };

        let mut bitmap = Pixmap::new(2, 2).unwrap();
        bitmap.fill([255, 0, 0, 255]);
        let mut store = AssetStore::new();
        store.insert("red", crate::model::Asset::Still(StillAsset { bitmap }));
        (project, store)
    }

    #[test]
    fn format_follows_the_extension() {
        assert_eq!(
            StillFormat::from_path(Path::new("a.png")).unwrap(),
            StillFormat::Png
        );
        assert_eq!(
            StillFormat::from_path(Path::new("a.JPG")).unwrap(),
            StillFormat::Jpeg
        );
        assert!(StillFormat::from_path(Path::new("a.tiff")).is_err());
    }

    #[test]
    fn png_keeps_transparency() {
        let (project, store) = red_project(Background::Transparent);
        let mut comp = Compositor::new();
        let bytes = export_still(
            &project,
            &store,
            &mut comp,
            0.0,
            StillFormat::Png,
            &ExportOptions::default(),
            None,
        )
        .unwrap();

        let img = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(2, 2).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn jpeg_flattens_to_opaque() {
        let (project, store) = red_project(Background::Transparent);
        let mut comp = Compositor::new();
        let bytes = export_still(
            &project,
            &store,
            &mut comp,
            0.0,
            StillFormat::Jpeg,
            &ExportOptions::default(),
            None,
        )
        .unwrap();

        let img = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (4, 4));
        // Transparent corner flattened to the black fallback; JPEG is lossy,
        // so allow residue.
        let corner = img.get_pixel(0, 0).0;
        assert!(corner[0] < 64 && corner[1] < 64 && corner[2] < 64);
        assert_eq!(corner[3], 255);
        let center = img.get_pixel(2, 2).0;
        assert!(center[0] > 180 && center[1] < 96 && center[2] < 96);
    }

    #[test]
    fn zero_sized_override_is_an_encode_error() {
        use crate::error::FramixError;
        let (project, store) = red_project(Background::Transparent);
        let mut comp = Compositor::new();
        let err = export_still(
            &project,
            &store,
            &mut comp,
            0.0,
            StillFormat::Png,
            &ExportOptions {
                width: Some(0),
                ..ExportOptions::default()
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FramixError::Encode(EncodeError::NoContext(_))
        ));
    }

    #[test]
    fn progress_runs_to_complete() {
        use std::sync::{Arc, Mutex};
        let (project, store) = red_project(Background::Transparent);
        let stages: Arc<Mutex<Vec<ExportStage>>> = Arc::new(Mutex::new(Vec::new()));
        let stages2 = Arc::clone(&stages);

        let mut comp = Compositor::new();
        export_still(
            &project,
            &store,
            &mut comp,
            0.0,
            StillFormat::Png,
            &ExportOptions::default(),
            Some(Box::new(move |p| stages2.lock().unwrap().push(p.stage))),
        )
        .unwrap();

        let stages = stages.lock().unwrap();
        assert_eq!(stages.first(), Some(&ExportStage::Preparing));
        assert_eq!(stages.last(), Some(&ExportStage::Complete));
    }

    #[test]
    fn failure_reports_the_failed_stage() {
        use std::sync::{Arc, Mutex};
        let (project, store) = red_project(Background::Transparent);
        let stages: Arc<Mutex<Vec<ExportStage>>> = Arc::new(Mutex::new(Vec::new()));
        let stages2 = Arc::clone(&stages);

        let mut comp = Compositor::new();
        let result = export_still(
            &project,
            &store,
            &mut comp,
            0.0,
            StillFormat::Png,
            &ExportOptions {
                width: Some(0),
                ..ExportOptions::default()
            },
            Some(Box::new(move |p| stages2.lock().unwrap().push(p.stage))),
        );

        assert!(result.is_err());
        assert_eq!(stages.lock().unwrap().last(), Some(&ExportStage::Failed));
    }
}
