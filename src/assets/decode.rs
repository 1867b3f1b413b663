use crate::{
    error::{DecodeError, FramixResult},
    model::{FrameSequenceAsset, SeqFrame, StillAsset},
    pixmap::{premultiply_rgba8_in_place, Pixmap},
};

pub fn decode_still(bytes: &[u8]) -> FramixResult<StillAsset> {
    let dyn_img = image::load_from_memory(bytes)
        .map_err(|e| DecodeError::UnsupportedFormat(format!("still image: {e}")))?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut data = rgba.into_raw();
    premultiply_rgba8_in_place(&mut data);

    Ok(StillAsset {
        bitmap: Pixmap::from_premul_rgba8(width, height, data)?,
    })
}

/// Decode an animated GIF into full-canvas frame snapshots.
///
/// GIF frames are patches composited onto a persistent canvas under a
/// disposal rule. This flattens that statefulness away: each emitted frame is
/// exactly what a viewer shows during that frame's delay.
pub fn decode_frame_sequence(bytes: &[u8]) -> FramixResult<FrameSequenceAsset> {
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::RGBA);
    let mut decoder = options
        .read_info(std::io::Cursor::new(bytes))
        .map_err(|e| DecodeError::UnsupportedFormat(format!("gif header: {e}")))?;

    let width = u32::from(decoder.width());
    let height = u32::from(decoder.height());
    let loop_count = match decoder.repeat() {
        gif::Repeat::Infinite => None,
        gif::Repeat::Finite(n) => Some(n),
    };

    // Straight-alpha accumulation canvas; premultiplied only at snapshot.
    let mut canvas = vec![0u8; width as usize * height as usize * 4];
    let mut frames = Vec::new();

    while let Some(frame) = decoder
        .read_next_frame()
        .map_err(|e| DecodeError::UnsupportedFormat(format!("gif frame: {e}")))?
    {
        let restore = if frame.dispose == gif::DisposalMethod::Previous {
            Some(canvas.clone())
        } else {
            None
        };

        blit_patch(&mut canvas, width, height, frame);

        let mut shown = canvas.clone();
        premultiply_rgba8_in_place(&mut shown);
        frames.push(SeqFrame {
            bitmap: Pixmap::from_premul_rgba8(width, height, shown)?,
            duration_ms: u64::from(frame.delay) * 10,
        });

        match frame.dispose {
            gif::DisposalMethod::Background => {
                clear_patch(
                    &mut canvas,
                    width,
                    height,
                    frame.left,
                    frame.top,
                    frame.width,
                    frame.height,
                );
            }
            gif::DisposalMethod::Previous => {
                if let Some(prev) = restore {
                    canvas = prev;
                }
            }
            gif::DisposalMethod::Keep | gif::DisposalMethod::Any => {}
        }
    }

    if frames.is_empty() {
        return Err(DecodeError::NoFrames.into());
    }
    FrameSequenceAsset::new(width, height, frames, loop_count)
}

/// Composite a decoded patch onto the canvas. GIF transparency is binary:
/// alpha-zero source pixels leave the canvas untouched, everything else
/// replaces.
fn blit_patch(canvas: &mut [u8], canvas_w: u32, canvas_h: u32, frame: &gif::Frame<'_>) {
    let left = u32::from(frame.left);
    let top = u32::from(frame.top);
    for py in 0..u32::from(frame.height) {
        let cy = top + py;
        if cy >= canvas_h {
            continue;
        }
        for px in 0..u32::from(frame.width) {
            let cx = left + px;
            if cx >= canvas_w {
                continue;
            }
            let src = (py as usize * frame.width as usize + px as usize) * 4;
            let Some(src_px) = frame.buffer.get(src..src + 4) else {
                continue;
            };
            if src_px[3] == 0 {
                continue;
            }
            let dst = (cy as usize * canvas_w as usize + cx as usize) * 4;
            canvas[dst..dst + 4].copy_from_slice(src_px);
        }
    }
}

fn clear_patch(canvas: &mut [u8], canvas_w: u32, canvas_h: u32, left: u16, top: u16, w: u16, h: u16) {
    for py in 0..u32::from(h) {
        let cy = u32::from(top) + py;
        if cy >= canvas_h {
            continue;
        }
        for px in 0..u32::from(w) {
            let cx = u32::from(left) + px;
            if cx >= canvas_w {
                continue;
            }
            let dst = (cy as usize * canvas_w as usize + cx as usize) * 4;
            canvas[dst..dst + 4].fill(0);
        }
    }
}
