use std::borrow::Cow;

use anyhow::Context;

use crate::{
    assets::AssetStore,
    clock::{resolve_loop_duration_ms, ExportTimeline},
    compositor::{Compositor, VideoSampling},
    error::{EncodeError, FramixError, FramixResult},
    export::{
        effective_settings,
        quantize::{quantize_rgba, QUANT_SAMPLEFAC},
    },
    model::{ExportOptions, Project},
    progress::{ExportStage, ProgressCallback, ProgressSink},
};

/// Uniform per-frame delay in GIF centiseconds. The format cannot represent
/// sub-centisecond steps, so high rates saturate at 1cs.
fn frame_delay_cs(fps: f64) -> u16 {
    let ms = (1000.0 / fps).round();
    ((ms / 10.0) as u16).max(1)
}

/// Render one full loop of the composition and encode it as an animated
/// GIF, returning the container bytes. Each frame is a full-canvas snapshot
/// quantized to its own palette, written with a uniform delay derived from
/// the composition rate; the file loops forever regardless of any source
/// asset's loop count.
#[tracing::instrument(skip(project, assets, compositor, options, progress))]
pub fn export_animation(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    options: &ExportOptions,
    progress: Option<ProgressCallback>,
) -> FramixResult<Vec<u8>> {
    let sink = ProgressSink::new(progress);
    let result = animation_bytes(project, assets, compositor, options, &sink);
    if let Err(err) = &result {
        sink.failed(err.to_string());
    }
    result
}

fn animation_bytes(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    options: &ExportOptions,
    sink: &ProgressSink,
) -> FramixResult<Vec<u8>> {
    project.validate()?;
    let settings = effective_settings(&project.settings, options);
    if !settings.fps.is_finite() || settings.fps <= 0.0 {
        return Err(FramixError::validation("export fps must be finite and > 0"));
    }
    if settings.width > u32::from(u16::MAX) || settings.height > u32::from(u16::MAX) {
        return Err(FramixError::validation(
            "gif dimensions must fit in 16 bits",
        ));
    }

    let loop_ms = resolve_loop_duration_ms(&settings, &project.layers, assets);
    let timeline = ExportTimeline::new(loop_ms, settings.fps);
    let delay_cs = frame_delay_cs(settings.fps);
    sink.stage(
        ExportStage::Preparing,
        0,
        format!(
            "{} frames over {loop_ms:.0}ms",
            timeline.frame_count()
        ),
    );

    let mut encoder = gif::Encoder::new(
        Vec::new(),
        settings.width as u16,
        settings.height as u16,
        &[],
    )
    .context("write gif header")?;
    encoder
        .set_repeat(gif::Repeat::Infinite)
        .context("write gif loop extension")?;

    let total = timeline.frame_count() as u64;
    for (i, time_ms) in timeline.times().enumerate() {
        let rendered = compositor.render_frame(
            &settings,
            &project.layers,
            assets,
            time_ms,
            VideoSampling::Blocking,
        )?;
        let straight = rendered.to_straight_rgba8();
        let quantized = quantize_rgba(&straight, QUANT_SAMPLEFAC)?;

        let mut frame = gif::Frame::default();
        frame.width = settings.width as u16;
        frame.height = settings.height as u16;
        frame.delay = delay_cs;
        // Full-canvas frames: transparent output must not let the previous
        // frame bleed through its holes.
        frame.dispose = if quantized.transparent.is_some() {
            gif::DisposalMethod::Background
        } else {
            gif::DisposalMethod::Keep
        };
        frame.transparent = quantized.transparent;
        frame.palette = Some(quantized.palette_rgb);
        frame.buffer = Cow::Owned(quantized.indices);

        encoder.write_frame(&frame).context("write gif frame")?;
        sink.rendering((i + 1) as u64, total);
    }
    compositor.finish();

    sink.stage(ExportStage::Encoding, 99, "finalizing gif");
    let bytes = encoder.into_inner().context("finish gif stream")?;
    if bytes.is_empty() {
        return Err(
            EncodeError::SerializationFailed("gif encoder produced no data".into()).into(),
        );
    }

    sink.complete(format!("encoded {} bytes", bytes.len()));
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::decode::decode_frame_sequence;
    use crate::model::{
        Asset, AssetSource, Background, CompositionSettings, FrameSequenceAsset, Layer,
        LayerTransform, SeqFrame,
    };
    use crate::pixmap::Pixmap;

    #[test]
    fn delay_is_centiseconds_with_a_floor() {
        assert_eq!(frame_delay_cs(30.0), 3);
        assert_eq!(frame_delay_cs(10.0), 10);
        assert_eq!(frame_delay_cs(60.0), 1);
        assert_eq!(frame_delay_cs(500.0), 1);
    }

    fn solid(rgba: [u8; 4]) -> Pixmap {
        let mut p = Pixmap::new(2, 2).unwrap();
        p.fill(rgba);
        p
    }

    fn two_color_project() -> (Project, AssetStore) {
        let frames = vec![
            SeqFrame {
                bitmap: solid([255, 0, 0, 255]),
                duration_ms: 100,
            },
            SeqFrame {
                bitmap: solid([0, 0, 255, 255]),
                duration_ms: 100,
            },
        ];
        let mut store = AssetStore::new();
        store.insert(
            "anim",
            Asset::Frames(FrameSequenceAsset::new(2, 2, frames, Some(1)).unwrap()),
        );

        let mut assets_doc = std::collections::BTreeMap::new();
        assets_doc.insert(
            "anim".to_string(),
            AssetSource::Animation {
                source: "anim.gif".to_string(),
            },
        );
        let project = Project {
            settings: CompositionSettings {
                width: 2,
                height: 2,
                fps: 10.0,
                loop_duration_ms: None,
                background: Background::Color {
                    rgba: [0, 0, 0, 255],
                },
            },
            layers: vec![Layer::new("l0", "anim", LayerTransform::at(1.0, 1.0))],
            assets: assets_doc,
        };
        (project, store)
    }

    #[test]
    fn exported_gif_round_trips_through_the_decoder() {
        let (project, store) = two_color_project();
        let mut comp = Compositor::new();
        let bytes = export_animation(
            &project,
            &store,
            &mut comp,
            &ExportOptions::default(),
            None,
        )
        .unwrap();

        let seq = decode_frame_sequence(&bytes).unwrap();

        // 200ms loop at 10fps: two frames, 100ms each, looping forever even
        // though the source asset declared a finite loop count.
        assert_eq!(seq.frames().len(), 2);
        assert_eq!(seq.loop_count, None);
        assert_eq!(seq.frames()[0].duration_ms, 100);

        let first = seq.frames()[0].bitmap.pixel(0, 0).unwrap();
        assert!(first[0] >= 200 && first[2] <= 64, "frame 0 was {first:?}");
        let second = seq.frames()[1].bitmap.pixel(0, 0).unwrap();
        assert!(second[2] >= 200 && second[0] <= 64, "frame 1 was {second:?}");
    }

    #[test]
    fn export_is_deterministic() {
        let (project, store) = two_color_project();
        let mut comp = Compositor::new();
        let first = export_animation(&project, &store, &mut comp, &ExportOptions::default(), None)
            .unwrap();
        let second = export_animation(&project, &store, &mut comp, &ExportOptions::default(), None)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transparent_composition_exports_transparent_frames() {
        let (mut project, store) = two_color_project();
        project.settings.background = Background::Transparent;
        project.layers.clear();
        project.settings.loop_duration_ms = Some(100.0);

        let mut comp = Compositor::new();
        let bytes = export_animation(
            &project,
            &store,
            &mut comp,
            &ExportOptions::default(),
            None,
        )
        .unwrap();

        let seq = decode_frame_sequence(&bytes).unwrap();
        assert_eq!(seq.frames().len(), 1);
        assert_eq!(seq.frames()[0].bitmap.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn oversized_canvas_is_rejected() {
        let (mut project, store) = two_color_project();
        project.settings.width = 70_000;
        let mut comp = Compositor::new();
        let err = export_animation(&project, &store, &mut comp, &ExportOptions::default(), None);
        assert!(err.is_err());
    }
}
