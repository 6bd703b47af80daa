use bytes::Bytes;

use crate::error::{RenderError, RenderResult};

/// One finished RGBA frame.
///
/// `Bytes` keeps downstream fan-out (pipeline, encoder, preview)
/// zero-copy: cloning a frame only bumps a reference count. Consumers
/// treat the pixel data as immutable.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    /// Fully transparent frame of the given size.
    pub fn transparent(width: u32, height: u32) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::CanvasAllocation(width, height));
        }
        let len = width as usize * height as usize * 4;
        Ok(Self {
            width,
            height,
            data: Bytes::from(vec![0u8; len]),
        })
    }

    /// Wrap an RGBA buffer, validating its length.
    pub fn from_rgba(width: u32, height: u32, data: Bytes) -> RenderResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(RenderError::CanvasAllocation(width, height));
        }
        Ok(Self { width, height, data })
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_frame_is_all_zero() {
        let frame = Frame::transparent(4, 2).expect("allocate");
        assert_eq!(frame.byte_len(), 32);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_size_canvas_rejected() {
        assert!(Frame::transparent(0, 10).is_err());
        assert!(Frame::transparent(10, 0).is_err());
    }

    #[test]
    fn from_rgba_checks_length() {
        assert!(Frame::from_rgba(2, 2, Bytes::from(vec![0u8; 16])).is_ok());
        assert!(Frame::from_rgba(2, 2, Bytes::from(vec![0u8; 12])).is_err());
    }
}
