use crate::error::{FramixError, FramixResult};

/// NeuQuant sampling factor. 10 trades palette fidelity for speed the same
/// way most GIF tooling does.
pub const QUANT_SAMPLEFAC: i32 = 10;

/// Alpha below this is fully transparent in the indexed output; GIF has no
/// partial coverage.
pub const ALPHA_OPAQUE_THRESHOLD: u8 = 128;

/// One frame reduced to an indexed palette.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PalettedFrame {
    /// RGB triples, at most 256 entries.
    pub palette_rgb: Vec<u8>,
    /// One palette index per pixel, row-major.
    pub indices: Vec<u8>,
    /// Index of the transparent slot, if the frame has transparency.
    pub transparent: Option<u8>,
}

/// Quantize one straight-alpha RGBA frame to an indexed palette.
///
/// When the frame has transparency, slot 0 is reserved for it and NeuQuant
/// gets 255 colors; otherwise all 256 slots hold colors. Deterministic:
/// same input pixels, same palette and indices. The exporters rely on that
/// for reproducible files.
pub fn quantize_rgba(straight_rgba: &[u8], samplefac: i32) -> FramixResult<PalettedFrame> {
    if straight_rgba.is_empty() || !straight_rgba.len().is_multiple_of(4) {
        return Err(FramixError::validation(
            "quantize expects a non-empty rgba8 buffer",
        ));
    }
    let px_count = straight_rgba.len() / 4;

    let mut has_transparent = false;
    let mut training = Vec::with_capacity(straight_rgba.len());
    for px in straight_rgba.chunks_exact(4) {
        if px[3] < ALPHA_OPAQUE_THRESHOLD {
            has_transparent = true;
        } else {
            // Uniform alpha keeps coverage out of the color distance.
            training.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
    }

    // Every pixel transparent: nothing to train on, emit a single-slot
    // palette instead of handing NeuQuant an empty sample set.
    if training.is_empty() {
        return Ok(PalettedFrame {
            palette_rgb: vec![0, 0, 0],
            indices: vec![0; px_count],
            transparent: Some(0),
        });
    }

    let max_colors = if has_transparent { 255 } else { 256 };
    let nq = color_quant::NeuQuant::new(samplefac, max_colors, &training);

    let (palette_rgb, offset, transparent) = if has_transparent {
        let mut palette = vec![0u8, 0, 0];
        palette.extend(nq.color_map_rgb());
        (palette, 1u8, Some(0u8))
    } else {
        (nq.color_map_rgb(), 0u8, None)
    };

    let mut indices = Vec::with_capacity(px_count);
    for px in straight_rgba.chunks_exact(4) {
        if px[3] < ALPHA_OPAQUE_THRESHOLD {
            indices.push(0);
        } else {
            indices.push(offset + nq.index_of(&[px[0], px[1], px[2], 255]) as u8);
        }
    }

    Ok(PalettedFrame {
        palette_rgb,
        indices,
        transparent,
    })
}
