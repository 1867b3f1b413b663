use crate::error::FramixResult;

pub type PremulRgba8 = [u8; 4];

/// Source-over for premultiplied RGBA8 with a layer opacity multiplier.
pub fn over(dst: PremulRgba8, src: PremulRgba8, opacity: f32) -> PremulRgba8 {
    let opacity = opacity.clamp(0.0, 1.0);
    if opacity <= 0.0 || src[3] == 0 {
        return dst;
    }

    let op = ((opacity * 255.0).round() as i32).clamp(0, 255) as u16;
    let sa = mul_div255(u16::from(src[3]), op);
    if sa == 0 {
        return dst;
    }

    let inv = 255u16 - u16::from(sa);

    let mut out = [0u8; 4];
    out[3] = add_sat_u8(sa, mul_div255(u16::from(dst[3]), inv));

    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), op);
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = add_sat_u8(sc, dc);
    }
    out
}

pub fn over_in_place(dst: &mut [u8], src: &[u8], opacity: f32) -> FramixResult<()> {
    if dst.len() != src.len() || !dst.len().is_multiple_of(4) {
        return Err(crate::FramixError::validation(
            "over_in_place expects equal-length rgba8 buffers",
        ));
    }
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let out = over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]], opacity);
        d.copy_from_slice(&out);
    }
    Ok(())
}

/// Flatten premultiplied RGBA onto an opaque background color, for encoders
/// without an alpha channel (JPEG, yuv420p sinks).
pub fn flatten_to_opaque_rgba8(dst: &mut [u8], src: &[u8], bg_rgba: [u8; 4]) -> FramixResult<()> {
    if dst.len() != src.len() || !dst.len().is_multiple_of(4) {
        return Err(crate::FramixError::validation(
            "flatten_to_opaque_rgba8 expects equal-length rgba8 buffers",
        ));
    }

    let bg_r = bg_rgba[0] as u16;
    let bg_g = bg_rgba[1] as u16;
    let bg_b = bg_rgba[2] as u16;

    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let a = s[3] as u16;
        if a == 255 {
            d.copy_from_slice(s);
            d[3] = 255;
            continue;
        }

        let inv = 255u16 - a;
        d[0] = add_sat_u8(s[0], mul_div255(bg_r, inv));
        d[1] = add_sat_u8(s[1], mul_div255(bg_g, inv));
        d[2] = add_sat_u8(s[2], mul_div255(bg_b, inv));
        d[3] = 255;
    }

    Ok(())
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

fn add_sat_u8(a: u8, b: u8) -> u8 {
    a.saturating_add(b)
}
