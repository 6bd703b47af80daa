//! Raster buffer and pixel operations.
//!
//! Buffers hold premultiplied RGBA. Straight-alpha inputs are
//! premultiplied on ingest; the encoder and preview paths treat the
//! composited output as already flattened over black.

use bytes::Bytes;

use framecast_core::layer::{Color, Position};

use crate::error::{RenderError, RenderResult};
use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA, row-major.
    pub data: Vec<u8>,
}

pub(crate) fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

/// Source-over for premultiplied pixels at an extra opacity.
pub(crate) fn over(dst: [u8; 4], src: [u8; 4], opacity: f32) -> [u8; 4] {
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
    out[3] = sa.saturating_add(mul_div255(u16::from(dst[3]), inv));
    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), op);
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = sc.saturating_add(dc);
    }
    out
}

/// Premultiply a straight color at the given opacity.
fn premul_color(color: Color, opacity: f32) -> [u8; 4] {
    let opacity = opacity.clamp(0.0, 1.0);
    let a = mul_div255(u16::from(color.a), ((opacity * 255.0).round() as i32).clamp(0, 255) as u16);
    [
        mul_div255(u16::from(color.r), u16::from(a)),
        mul_div255(u16::from(color.g), u16::from(a)),
        mul_div255(u16::from(color.b), u16::from(a)),
        a,
    ]
}

impl Raster {
    pub fn new(width: u32, height: u32) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::CanvasAllocation(width, height));
        }
        Ok(Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 4],
        })
    }

    /// Ingest a straight-alpha RGBA buffer, premultiplying.
    pub fn from_straight_rgba(width: u32, height: u32, rgba: &[u8]) -> RenderResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() != expected {
            return Err(RenderError::CanvasAllocation(width, height));
        }
        let mut data = vec![0u8; expected];
        for (d, s) in data.chunks_exact_mut(4).zip(rgba.chunks_exact(4)) {
            let a = u16::from(s[3]);
            d[0] = mul_div255(u16::from(s[0]), a);
            d[1] = mul_div255(u16::from(s[1]), a);
            d[2] = mul_div255(u16::from(s[2]), a);
            d[3] = s[3];
        }
        Ok(Self { width, height, data })
    }

    #[must_use]
    pub fn into_frame(self) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            data: Bytes::from(self.data),
        }
    }

    #[inline]
    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2], self.data[idx + 3]]
    }

    #[inline]
    fn set_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        self.data[idx..idx + 4].copy_from_slice(&px);
    }

    #[inline]
    fn blend_pixel(&mut self, x: i64, y: i64, src: [u8; 4], opacity: f32) {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        let blended = over(self.pixel(x, y), src, opacity);
        self.set_pixel(x, y, blended);
    }

    /// Blend `src` over this buffer with its top-left corner at (x, y),
    /// clipping to bounds.
    pub fn blit_over(&mut self, src: &Raster, x: i64, y: i64, opacity: f32) {
        if opacity <= 0.0 {
            return;
        }
        for sy in 0..src.height {
            let dy = y + i64::from(sy);
            if dy < 0 || dy >= i64::from(self.height) {
                continue;
            }
            for sx in 0..src.width {
                let dx = x + i64::from(sx);
                if dx < 0 || dx >= i64::from(self.width) {
                    continue;
                }
                let s = src.pixel(sx, sy);
                if s[3] == 0 {
                    continue;
                }
                let d = over(self.pixel(dx as u32, dy as u32), s, opacity);
                self.set_pixel(dx as u32, dy as u32, d);
            }
        }
    }

    pub fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Color, opacity: f32) {
        let src = premul_color(color, opacity);
        if src[3] == 0 {
            return;
        }
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        let x1 = (x + w).ceil() as i64;
        let y1 = (y + h).ceil() as i64;
        for py in y0..y1 {
            for px in x0..x1 {
                self.blend_pixel(px, py, src, 1.0);
            }
        }
    }

    pub fn fill_circle(&mut self, cx: f32, cy: f32, radius: f32, color: Color, opacity: f32) {
        let src = premul_color(color, opacity);
        if src[3] == 0 || radius <= 0.0 {
            return;
        }
        let r2 = radius * radius;
        let x0 = (cx - radius).floor() as i64;
        let x1 = (cx + radius).ceil() as i64;
        let y0 = (cy - radius).floor() as i64;
        let y1 = (cy + radius).ceil() as i64;
        for py in y0..=y1 {
            for px in x0..=x1 {
                let dx = px as f32 + 0.5 - cx;
                let dy = py as f32 + 0.5 - cy;
                if dx * dx + dy * dy <= r2 {
                    self.blend_pixel(px, py, src, 1.0);
                }
            }
        }
    }

    /// Even-odd scanline polygon fill. At least three points are
    /// required; the caller validates.
    pub fn fill_polygon(&mut self, points: &[Position], color: Color, opacity: f32) -> RenderResult<()> {
        if points.len() < 3 {
            return Err(RenderError::InvalidShape(format!(
                "polygon needs at least 3 points, got {}",
                points.len()
            )));
        }
        let src = premul_color(color, opacity);
        if src[3] == 0 {
            return Ok(());
        }

        let y_min = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min).floor() as i64;
        let y_max = points.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max).ceil() as i64;

        let mut crossings: Vec<f32> = Vec::with_capacity(points.len());
        for py in y_min..=y_max {
            let scan_y = py as f32 + 0.5;
            crossings.clear();
            for i in 0..points.len() {
                let a = points[i];
                let b = points[(i + 1) % points.len()];
                if (a.y <= scan_y && b.y > scan_y) || (b.y <= scan_y && a.y > scan_y) {
                    let t = (scan_y - a.y) / (b.y - a.y);
                    crossings.push(a.x + t * (b.x - a.x));
                }
            }
            crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for pair in crossings.chunks_exact(2) {
                let x0 = pair[0].round() as i64;
                let x1 = pair[1].round() as i64;
                for px in x0..x1 {
                    self.blend_pixel(px, py, src, 1.0);
                }
            }
        }
        Ok(())
    }

    /// Stroke a line by stamping disks along its length.
    pub fn draw_line(&mut self, from: Position, to: Position, thickness: f32, color: Color, opacity: f32) {
        let dx = to.x - from.x;
        let dy = to.y - from.y;
        let length = (dx * dx + dy * dy).sqrt();
        let steps = (length.ceil() as usize).max(1);
        let radius = (thickness / 2.0).max(0.5);
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            self.fill_circle(from.x + dx * t, from.y + dy * t, radius, color, opacity);
        }
    }

    /// Rotate clockwise by `degrees`, expanding to the rotated bounding
    /// box with transparent padding. Nearest-neighbor sampling.
    pub fn rotate(&self, degrees: f32) -> RenderResult<Raster> {
        let radians = degrees.to_radians();
        if radians.abs() < f32::EPSILON {
            return Ok(self.clone());
        }
        let (sin, cos) = radians.sin_cos();
        let (w, h) = (self.width as f32, self.height as f32);
        let new_w = (w * cos.abs() + h * sin.abs()).round().max(1.0) as u32;
        let new_h = (w * sin.abs() + h * cos.abs()).round().max(1.0) as u32;

        let mut out = Raster::new(new_w, new_h)?;
        let (ocx, ocy) = (new_w as f32 / 2.0, new_h as f32 / 2.0);
        let (icx, icy) = (w / 2.0, h / 2.0);

        for y in 0..new_h {
            for x in 0..new_w {
                // Inverse-map the output pixel into source space.
                let rx = x as f32 + 0.5 - ocx;
                let ry = y as f32 + 0.5 - ocy;
                let sx = rx * cos + ry * sin + icx;
                let sy = -rx * sin + ry * cos + icy;
                if sx < 0.0 || sy < 0.0 || sx >= w || sy >= h {
                    continue;
                }
                out.set_pixel(x, y, self.pixel(sx as u32, sy as u32));
            }
        }
        Ok(out)
    }

    /// Uniform scale via bilinear resampling.
    pub fn scale(&self, factor: f32) -> RenderResult<Raster> {
        if (factor - 1.0).abs() < f32::EPSILON {
            return Ok(self.clone());
        }
        if factor <= 0.0 {
            return Err(RenderError::InvalidShape(format!("scale factor {factor} must be positive")));
        }
        let new_w = ((self.width as f32 * factor).round().max(1.0)) as u32;
        let new_h = ((self.height as f32 * factor).round().max(1.0)) as u32;
        self.resize(new_w, new_h)
    }

    /// Resize to exact dimensions via bilinear resampling.
    pub fn resize(&self, new_w: u32, new_h: u32) -> RenderResult<Raster> {
        if new_w == 0 || new_h == 0 {
            return Err(RenderError::CanvasAllocation(new_w, new_h));
        }
        if new_w == self.width && new_h == self.height {
            return Ok(self.clone());
        }
        let img = image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or(RenderError::CanvasAllocation(self.width, self.height))?;
        let resized = image::imageops::resize(&img, new_w, new_h, image::imageops::FilterType::Triangle);
        Ok(Raster {
            width: new_w,
            height: new_h,
            data: resized.into_raw(),
        })
    }
}
