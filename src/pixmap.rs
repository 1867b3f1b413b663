use crate::error::{FramixResult, RenderError};

/// Premultiplied RGBA8 raster surface, row major.
///
/// Serves both as the decoded-asset bitmap storage and as the composition
/// target. All compositing happens premultiplied; `to_straight_rgba8`
/// converts back for alpha-preserving encoders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pixmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Pixmap {
    /// Allocate a fully transparent surface.
    ///
    /// Zero-sized surfaces are rejected: a drawing target that cannot hold a
    /// single pixel is the "no drawing context" condition.
    pub fn new(width: u32, height: u32) -> FramixResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::NoContext(format!(
                "cannot allocate {width}x{height} surface"
            ))
            .into());
        }
        let len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        Ok(Self {
            width,
            height,
            data: vec![0u8; len],
        })
    }

    /// Wrap an existing premultiplied RGBA8 buffer.
    pub fn from_premul_rgba8(width: u32, height: u32, data: Vec<u8>) -> FramixResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::NoContext(format!(
                "cannot wrap {width}x{height} surface"
            ))
            .into());
        }
        let expected = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        if data.len() != expected {
            return Err(crate::error::FramixError::validation(format!(
                "pixmap buffer size mismatch: got {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Reset every pixel to transparent black.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Flood fill with a straight-alpha color (premultiplied on write).
    pub fn fill(&mut self, rgba: [u8; 4]) {
        let px = premul_rgba8(rgba);
        for chunk in self.data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
    }

    /// Premultiplied pixel at `(x, y)`, or `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + (x as usize)) * 4;
        Some([
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ])
    }

    /// Un-premultiplied copy of the buffer for straight-alpha encoders.
    pub fn to_straight_rgba8(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        for px in out.chunks_exact_mut(4) {
            let a = px[3] as u16;
            if a == 0 {
                px[0] = 0;
                px[1] = 0;
                px[2] = 0;
            } else if a != 255 {
                px[0] = (((px[0] as u16) * 255 + a / 2) / a).min(255) as u8;
                px[1] = (((px[1] as u16) * 255 + a / 2) / a).min(255) as u8;
                px[2] = (((px[2] as u16) * 255 + a / 2) / a).min(255) as u8;
            }
        }
        out
    }
}

/// Premultiply one straight-alpha RGBA8 pixel.
pub fn premul_rgba8(rgba: [u8; 4]) -> [u8; 4] {
    let a = rgba[3] as u16;
    [
        mul_div255_round(rgba[0] as u16, a),
        mul_div255_round(rgba[1] as u16, a),
        mul_div255_round(rgba[2] as u16, a),
        rgba[3],
    ]
}

/// Premultiply a straight-alpha RGBA8 buffer in place.
pub fn premultiply_rgba8_in_place(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 {
            continue;
        }
        px[0] = mul_div255_round(px[0] as u16, a);
        px[1] = mul_div255_round(px[1] as u16, a);
        px[2] = mul_div255_round(px[2] as u16, a);
    }
}

fn mul_div255_round(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_zero_dimensions() {
        assert!(Pixmap::new(0, 10).is_err());
        assert!(Pixmap::new(10, 0).is_err());
        assert!(Pixmap::new(2, 2).is_ok());
    }

    #[test]
    fn from_premul_checks_buffer_length() {
        assert!(Pixmap::from_premul_rgba8(2, 2, vec![0u8; 16]).is_ok());
        assert!(Pixmap::from_premul_rgba8(2, 2, vec![0u8; 15]).is_err());
    }

    #[test]
    fn fill_premultiplies() {
        let mut pm = Pixmap::new(2, 1).unwrap();
        pm.fill([255, 0, 0, 128]);
        assert_eq!(pm.pixel(0, 0), Some([128, 0, 0, 128]));
        assert_eq!(pm.pixel(1, 0), Some([128, 0, 0, 128]));
    }

    #[test]
    fn pixel_is_none_out_of_bounds() {
        let pm = Pixmap::new(2, 2).unwrap();
        assert!(pm.pixel(2, 0).is_none());
        assert!(pm.pixel(0, 2).is_none());
    }

    #[test]
    fn straight_round_trip_is_close() {
        let straight = [200u8, 100, 40, 128];
        let mut buf = straight.to_vec();
        premultiply_rgba8_in_place(&mut buf);
        let pm = Pixmap::from_premul_rgba8(1, 1, buf).unwrap();
        let back = pm.to_straight_rgba8();
        for (got, want) in back.iter().zip(straight.iter()) {
            assert!((*got as i32 - *want as i32).abs() <= 1, "{got} vs {want}");
        }
    }

    #[test]
    fn opaque_pixels_survive_round_trip_exactly() {
        let pm = Pixmap::from_premul_rgba8(1, 1, vec![255, 0, 0, 255]).unwrap();
        assert_eq!(pm.to_straight_rgba8(), vec![255, 0, 0, 255]);
    }
}
