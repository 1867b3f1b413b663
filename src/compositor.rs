use std::collections::BTreeMap;

use kurbo::Point;

use crate::{
    assets::{
        media::{VideoHandle, VideoPool, VideoPoolStats},
        AssetStore,
    },
    composite::over,
    error::FramixResult,
    model::{Asset, CompositionSettings, Layer, VideoAsset},
    pixmap::Pixmap,
};

/// How video layers resolve a frame for the requested time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoSampling {
    /// Wait for the exact frame; export paths use this.
    Blocking,
    /// Take the freshest decoded frame and schedule a seek; interactive
    /// preview uses this and tolerates staleness.
    Latest,
}

/// Stateful renderer. Holds borrowed video handles for the duration of a
/// render run so repeated frames reuse the same seek workers; call
/// [`Compositor::finish`] between runs to return them to the pool.
pub struct Compositor {
    pool: VideoPool,
    held: BTreeMap<String, VideoHandle>,
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            pool: VideoPool::default(),
            held: BTreeMap::new(),
        }
    }

    pub fn with_pool(pool: VideoPool) -> Self {
        Self {
            pool,
            held: BTreeMap::new(),
        }
    }

    /// Render the composition at `time_ms` into a fresh surface sized per
    /// `settings`.
    pub fn render_frame(
        &mut self,
        settings: &CompositionSettings,
        layers: &[Layer],
        assets: &AssetStore,
        time_ms: f64,
        sampling: VideoSampling,
    ) -> FramixResult<Pixmap> {
        let mut target = Pixmap::new(settings.width, settings.height)?;
        self.composite_into(&mut target, settings, layers, assets, time_ms, sampling)?;
        Ok(target)
    }

    /// Paint the composition at `time_ms` into an existing surface. The
    /// surface is reset first (background fill or transparent clear), so a
    /// preview loop can reuse one allocation across ticks.
    ///
    /// A layer that fails to draw is logged and skipped; one broken asset
    /// must not take down the whole frame.
    #[tracing::instrument(skip(self, target, settings, layers, assets))]
    pub fn composite_into(
        &mut self,
        target: &mut Pixmap,
        settings: &CompositionSettings,
        layers: &[Layer],
        assets: &AssetStore,
        time_ms: f64,
        sampling: VideoSampling,
    ) -> FramixResult<()> {
        match settings.background.fill_rgba() {
            Some(rgba) => target.fill(rgba),
            None => target.clear(),
        }

        for layer in layers {
            if let Err(err) = self.draw_layer(target, layer, assets, time_ms, sampling) {
                tracing::warn!(layer = %layer.id, error = %err, "layer failed to render, skipping");
            }
        }

        Ok(())
    }

    /// Return all held video handles to the pool. Call after a render run.
    pub fn finish(&mut self) {
        let held = std::mem::take(&mut self.held);
        for (_, handle) in held {
            self.pool.release(handle);
        }
    }

    pub fn pool_stats(&self) -> VideoPoolStats {
        self.pool.stats()
    }

    fn draw_layer(
        &mut self,
        target: &mut Pixmap,
        layer: &Layer,
        assets: &AssetStore,
        time_ms: f64,
        sampling: VideoSampling,
    ) -> FramixResult<()> {
        if !layer.visible {
            return Ok(());
        }
        let transform = layer.transform.clamped();
        if transform.opacity <= 0.0 {
            return Ok(());
        }

        // Dangling references are a tolerated document state, not an error.
        let Some(asset) = assets.get(&layer.asset) else {
            tracing::debug!(layer = %layer.id, asset = %layer.asset, "layer references no known asset");
            return Ok(());
        };

        match asset {
            Asset::Still(still) => {
                draw_bitmap(target, &still.bitmap, &transform, transform.opacity)
            }
            Asset::Frames(seq) => {
                draw_bitmap(target, seq.bitmap_at(time_ms), &transform, transform.opacity)
            }
            Asset::Video(video) => {
                let handle = self.video_handle(&layer.asset, video)?;
                match sampling {
                    VideoSampling::Blocking => {
                        let frame = handle.sample_blocking(time_ms)?;
                        draw_bitmap(target, frame, &transform, transform.opacity)
                    }
                    VideoSampling::Latest => match handle.sample_latest(time_ms) {
                        Some(frame) => {
                            draw_bitmap(target, frame, &transform, transform.opacity)
                        }
                        // Nothing decoded yet; the layer appears once the
                        // first seek lands.
                        None => Ok(()),
                    },
                }
            }
        }
    }

    fn video_handle(&mut self, id: &str, asset: &VideoAsset) -> FramixResult<&mut VideoHandle> {
        match self.held.entry(id.to_string()) {
            std::collections::btree_map::Entry::Occupied(e) => Ok(e.into_mut()),
            std::collections::btree_map::Entry::Vacant(v) => Ok(v.insert(self.pool.borrow(asset)?)),
        }
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

/// Paint `src` onto `target` under the layer transform, blending with
/// source-over at the given opacity. Each target pixel inside the projected
/// bounding box is pulled back through the inverse affine and bilinearly
/// sampled, so rotation and fractional scale need no special casing.
fn draw_bitmap(
    target: &mut Pixmap,
    src: &Pixmap,
    transform: &crate::model::LayerTransform,
    opacity: f64,
) -> FramixResult<()> {
    let (src_w, src_h) = (src.width() as f64, src.height() as f64);
    let affine = transform.to_affine(src_w, src_h);
    if affine.determinant().abs() < 1e-12 {
        return Ok(());
    }
    let inv = affine.inverse();

    // Forward-project the source corners to bound the affected target area.
    let corners = [
        affine * Point::new(0.0, 0.0),
        affine * Point::new(src_w, 0.0),
        affine * Point::new(0.0, src_h),
        affine * Point::new(src_w, src_h),
    ];
    let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = corners
        .iter()
        .map(|p| p.x)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = corners
        .iter()
        .map(|p| p.y)
        .fold(f64::NEG_INFINITY, f64::max);

    let x0 = (min_x.floor().max(0.0)) as u32;
    let y0 = (min_y.floor().max(0.0)) as u32;
    let x1 = (max_x.ceil().min(f64::from(target.width()))) as u32;
    let y1 = (max_y.ceil().min(f64::from(target.height()))) as u32;
    if x0 >= x1 || y0 >= y1 {
        return Ok(());
    }

    let opacity = opacity.clamp(0.0, 1.0) as f32;
    let target_w = target.width() as usize;
    let data = target.data_mut();
    for y in y0..y1 {
        for x in x0..x1 {
            let local = inv * Point::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
            let sample = sample_bilinear(src, local.x - 0.5, local.y - 0.5);
            if sample[3] == 0 {
                continue;
            }
            let idx = (y as usize * target_w + x as usize) * 4;
            let dst: &mut [u8; 4] = (&mut data[idx..idx + 4]).try_into().map_err(|_| {
                crate::error::FramixError::no_surface("target pixel slice misaligned")
            })?;
            *dst = over(*dst, sample, opacity);
        }
    }

    Ok(())
}

/// Bilinear sample from a premultiplied source at fractional pixel-center
/// coordinates. Out-of-bounds taps are transparent, which gives soft edges
/// at layer borders.
fn sample_bilinear(src: &Pixmap, u: f64, v: f64) -> [u8; 4] {
    let x0 = u.floor() as i64;
    let y0 = v.floor() as i64;
    let fx = u - x0 as f64;
    let fy = v - y0 as f64;

    let fetch = |x: i64, y: i64| -> [f64; 4] {
        if x < 0 || y < 0 || x >= i64::from(src.width()) || y >= i64::from(src.height()) {
            return [0.0; 4];
        }
        match src.pixel(x as u32, y as u32) {
            Some(px) => [
                f64::from(px[0]),
                f64::from(px[1]),
                f64::from(px[2]),
                f64::from(px[3]),
            ],
            None => [0.0; 4],
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Background, LayerTransform, StillAsset};

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> Pixmap {
        let mut p = Pixmap::new(w, h).unwrap();
        p.fill(rgba);
        p
    }

    fn still(w: u32, h: u32, rgba: [u8; 4]) -> Asset {
        Asset::Still(StillAsset {
            bitmap: solid(w, h, rgba),
        })
    }

    fn settings(w: u32, h: u32) -> CompositionSettings {
        CompositionSettings {
            width: w,
            height: h,
            fps: 30.0,
            loop_duration_ms: None,
            background: Background::Transparent,
        }
    }

    #[test]
    fn centered_still_lands_where_placed() {
        let mut assets = AssetStore::new();
        assets.insert("red", still(2, 2, [255, 0, 0, 255]));
        let layers = vec![Layer::new("l0", "red", LayerTransform::at(4.0, 4.0))];

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(8, 8), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        assert_eq!(frame.pixel(4, 4), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(3, 3), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn later_layers_draw_on_top() {
        let mut assets = AssetStore::new();
        assets.insert("green", still(4, 4, [0, 255, 0, 255]));
        assets.insert("red", still(4, 4, [255, 0, 0, 255]));
        assets.insert("blue", still(4, 4, [0, 0, 255, 255]));
        let layers = vec![
            Layer::new("back", "green", LayerTransform::at(3.0, 3.0)),
            Layer::new("mid", "red", LayerTransform::at(4.0, 4.0)),
            Layer::new("front", "blue", LayerTransform::at(5.0, 5.0)),
        ];

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(8, 8), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        // Where all three overlap, the last layer in the list wins.
        assert_eq!(frame.pixel(4, 4), Some([0, 0, 255, 255]));
        // Pairwise overlaps keep list order too.
        assert_eq!(frame.pixel(2, 2), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(6, 6), Some([0, 0, 255, 255]));
        // Each layer still shows where nothing covers it.
        assert_eq!(frame.pixel(1, 1), Some([0, 255, 0, 255]));
        assert_eq!(frame.pixel(7, 7), Some([0, 0, 0, 0]));
    }

    #[test]
    fn half_opacity_halves_coverage_on_transparent_canvas() {
        let mut assets = AssetStore::new();
        assets.insert("red", still(2, 2, [255, 0, 0, 255]));
        let layers = vec![Layer::new(
            "l0",
            "red",
            LayerTransform::at(1.0, 1.0).with_opacity(0.5),
        )];

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(2, 2), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        let px = frame.pixel(0, 0).unwrap();
        assert!(px[3] >= 127 && px[3] <= 128, "alpha was {}", px[3]);
        assert_eq!(px[0], px[3]);
    }

    #[test]
    fn invisible_and_zero_opacity_layers_are_skipped() {
        let mut assets = AssetStore::new();
        assets.insert("red", still(2, 2, [255, 0, 0, 255]));
        let mut hidden = Layer::new("h", "red", LayerTransform::at(1.0, 1.0));
        hidden.visible = false;
        let clear = Layer::new("c", "red", LayerTransform::at(1.0, 1.0).with_opacity(0.0));

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(
                &settings(2, 2),
                &[hidden, clear],
                &assets,
                0.0,
                VideoSampling::Blocking,
            )
            .unwrap();

        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn reused_surface_is_reset_before_painting() {
        let mut assets = AssetStore::new();
        assets.insert("red", still(2, 2, [255, 0, 0, 255]));
        let layers = vec![Layer::new("l0", "red", LayerTransform::at(1.0, 1.0))];

        let mut comp = Compositor::new();
        let mut surface = Pixmap::new(4, 4).unwrap();
        surface.fill([0, 255, 0, 255]);
        comp.composite_into(
            &mut surface,
            &settings(4, 4),
            &layers,
            &assets,
            0.0,
            VideoSampling::Blocking,
        )
        .unwrap();

        assert_eq!(surface.pixel(0, 0), Some([255, 0, 0, 255]));
        // The stale green fill is gone where no layer painted.
        assert_eq!(surface.pixel(3, 3), Some([0, 0, 0, 0]));
    }

    #[test]
    fn dangling_asset_reference_is_a_noop() {
        let assets = AssetStore::new();
        let layers = vec![Layer::new("l0", "missing", LayerTransform::at(1.0, 1.0))];

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(2, 2), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn background_color_fills_before_layers() {
        let mut s = settings(2, 2);
        s.background = Background::Color {
            rgba: [0, 255, 0, 255],
        };
        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&s, &[], &AssetStore::new(), 0.0, VideoSampling::Blocking)
            .unwrap();
        assert_eq!(frame.pixel(1, 1), Some([0, 255, 0, 255]));
    }

    #[test]
    fn double_scale_covers_the_doubled_footprint() {
        let mut assets = AssetStore::new();
        assets.insert("red", still(2, 2, [255, 0, 0, 255]));
        let layers = vec![Layer::new(
            "l0",
            "red",
            LayerTransform::at(2.0, 2.0).with_scale(2.0, 2.0),
        )];

        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(4, 4), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        for (x, y) in [(1u32, 1u32), (2, 2), (1, 2), (2, 1)] {
            assert_eq!(frame.pixel(x, y), Some([255, 0, 0, 255]), "at {x},{y}");
        }
    }

    #[test]
    fn quarter_turn_remaps_a_row_to_a_column() {
        let mut bitmap = Pixmap::new(3, 1).unwrap();
        bitmap.data_mut()[0..4].copy_from_slice(&[255, 0, 0, 255]);
        bitmap.data_mut()[4..8].copy_from_slice(&[0, 255, 0, 255]);
        bitmap.data_mut()[8..12].copy_from_slice(&[0, 0, 255, 255]);
        let mut assets = AssetStore::new();
        assets.insert("strip", Asset::Still(StillAsset { bitmap }));

        let layers = vec![Layer::new(
            "l0",
            "strip",
            LayerTransform::at(1.5, 1.5).with_rotation_deg(90.0),
        )];
        let mut comp = Compositor::new();
        let frame = comp
            .render_frame(&settings(3, 3), &layers, &assets, 0.0, VideoSampling::Blocking)
            .unwrap();

        assert_eq!(frame.pixel(1, 0), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(1, 1), Some([0, 255, 0, 255]));
        assert_eq!(frame.pixel(1, 2), Some([0, 0, 255, 255]));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn frame_sequence_layers_follow_the_timeline() {
        use crate::model::{FrameSequenceAsset, SeqFrame};
        let frames = vec![
            SeqFrame {
                bitmap: solid(2, 2, [255, 0, 0, 255]),
                duration_ms: 100,
            },
            SeqFrame {
                bitmap: solid(2, 2, [0, 0, 255, 255]),
                duration_ms: 100,
            },
        ];
        let mut assets = AssetStore::new();
        assets.insert(
            "anim",
            Asset::Frames(FrameSequenceAsset::new(2, 2, frames, None).unwrap()),
        );
        let layers = vec![Layer::new("l0", "anim", LayerTransform::at(1.0, 1.0))];

        let mut comp = Compositor::new();
        let early = comp
            .render_frame(&settings(2, 2), &layers, &assets, 50.0, VideoSampling::Blocking)
            .unwrap();
        let late = comp
            .render_frame(&settings(2, 2), &layers, &assets, 150.0, VideoSampling::Blocking)
            .unwrap();
        let wrapped = comp
            .render_frame(&settings(2, 2), &layers, &assets, 250.0, VideoSampling::Blocking)
            .unwrap();

        assert_eq!(early.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(late.pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(wrapped.pixel(0, 0), Some([255, 0, 0, 255]));
    }
}
