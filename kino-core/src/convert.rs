//! Decoded-frame model and YUV to RGB conversion.
//!
//! Decoders output YUV (YUV420P or NV12); the presenter wants RGB24.
//! Conversion uses pre-computed fixed-point lookup tables and integer
//! math only, writing into a single reusable output buffer that is
//! overwritten each frame and never aliased across frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Frame format {got:?} does not match converter format {want:?}")]
    FormatMismatch { want: PixelFormat, got: PixelFormat },
    #[error("Frame size {got_w}x{got_h} does not match converter size {want_w}x{want_h}")]
    SizeMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
    #[error("Unsupported conversion from {0:?}")]
    Unsupported(PixelFormat),
}

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4:2:0 planar: Y plane + quarter-size U and V planes.
    Yuv420p,
    /// 4:2:0 semi-planar: Y plane + interleaved UV plane.
    Nv12,
    /// Packed 8-bit RGB (post-conversion).
    Rgb24,
}

impl PixelFormat {
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Yuv420p | Self::Nv12 => w * h * 3 / 2,
            Self::Rgb24 => w * h * 3,
        }
    }
}

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    /// SD video.
    Bt601,
    /// HD video.
    Bt709,
}

impl ColorSpace {
    /// Luma weights (Wr, Wb); Wg = 1 - Wr - Wb.
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
        }
    }

    /// Chroma contributions derived from the luma weights:
    /// R = Y + 2(1-Wr)Cr, B = Y + 2(1-Wb)Cb, and G balances both.
    fn chroma_terms(&self) -> ChromaTerms {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;
        ChromaTerms {
            cr_r: 2.0 * (1.0 - wr),
            cb_g: -2.0 * wb * (1.0 - wb) / wg,
            cr_g: -2.0 * wr * (1.0 - wr) / wg,
            cb_b: 2.0 * (1.0 - wb),
        }
    }
}

struct ChromaTerms {
    cr_r: f32,
    cb_g: f32,
    cr_g: f32,
    cb_b: f32,
}

// ============================================================================
// Frames
// ============================================================================

/// A decoded video frame in planar storage. Owned by the video decode
/// session until handed to the converter.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub pts_us: i64,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0u8; format.buffer_size(width, height)],
            pts_us: 0,
        }
    }

    /// Plane data for the frame's format. Index 0 is always luma.
    pub fn plane(&self, index: usize) -> &[u8] {
        let y_size = self.width as usize * self.height as usize;
        match self.format {
            PixelFormat::Yuv420p => {
                let uv_size = y_size / 4;
                match index {
                    0 => &self.data[..y_size],
                    1 => &self.data[y_size..y_size + uv_size],
                    2 => &self.data[y_size + uv_size..],
                    _ => &[],
                }
            }
            PixelFormat::Nv12 => match index {
                0 => &self.data[..y_size],
                1 => &self.data[y_size..],
                _ => &[],
            },
            PixelFormat::Rgb24 => &self.data,
        }
    }
}

/// The converted RGB24 frame handed to the presenter. One instance per
/// converter, overwritten in place on every conversion.
#[derive(Debug)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, `stride` bytes per row.
    pub data: Vec<u8>,
    pub stride: usize,
    pub pts_us: i64,
}

/// The display collaborator: consumes a converted frame. Upload and
/// presentation internals are outside this engine.
pub trait PresentSink: Send {
    fn present(&mut self, frame: &RgbFrame);
}

// ============================================================================
// Converter
// ============================================================================

/// LUT-based YUV→RGB24 converter for one fixed geometry.
pub struct FrameConverter {
    src_format: PixelFormat,
    width: u32,
    height: u32,
    out: RgbFrame,
    // 8.8 fixed-point lookup tables, one entry per code value.
    y_table: [i32; 256],
    u_table_g: [i32; 256],
    u_table_b: [i32; 256],
    v_table_r: [i32; 256],
    v_table_g: [i32; 256],
}

impl FrameConverter {
    pub fn new(width: u32, height: u32, src_format: PixelFormat, color_space: ColorSpace) -> Self {
        let mut converter = Self {
            src_format,
            width,
            height,
            out: RgbFrame {
                width,
                height,
                data: vec![0u8; PixelFormat::Rgb24.buffer_size(width, height)],
                stride: width as usize * 3,
                pts_us: 0,
            },
            y_table: [0; 256],
            u_table_g: [0; 256],
            u_table_b: [0; 256],
            v_table_r: [0; 256],
            v_table_g: [0; 256],
        };
        converter.build_tables(color_space);
        converter
    }

    fn build_tables(&mut self, color_space: ColorSpace) {
        let terms = color_space.chroma_terms();
        for i in 0..256 {
            let y = i as i32 - 16; // limited-range Y: 16..235
            let uv = i as i32 - 128; // U/V centered at 128

            // 298/256 ≈ 1.164 rescales 16..235 to full range.
            self.y_table[i] = (y * 298) >> 8;
            self.u_table_g[i] = (uv as f32 * terms.cb_g * 256.0) as i32;
            self.u_table_b[i] = (uv as f32 * terms.cb_b * 256.0) as i32;
            self.v_table_r[i] = (uv as f32 * terms.cr_r * 256.0) as i32;
            self.v_table_g[i] = (uv as f32 * terms.cr_g * 256.0) as i32;
        }
    }

    /// Whether `frame` matches the geometry and format this converter
    /// was built for.
    pub fn matches(&self, frame: &VideoFrame) -> bool {
        frame.format == self.src_format && frame.width == self.width && frame.height == self.height
    }

    /// Convert `src` into the reusable RGB buffer and hand back a
    /// borrow of it. The previous frame's pixels are gone after this.
    pub fn convert(&mut self, src: &VideoFrame) -> Result<&RgbFrame, ConvertError> {
        if src.format != self.src_format {
            return Err(ConvertError::FormatMismatch {
                want: self.src_format,
                got: src.format,
            });
        }
        if src.width != self.width || src.height != self.height {
            return Err(ConvertError::SizeMismatch {
                want_w: self.width,
                want_h: self.height,
                got_w: src.width,
                got_h: src.height,
            });
        }

        match self.src_format {
            PixelFormat::Yuv420p => self.yuv420p_to_rgb(src),
            PixelFormat::Nv12 => self.nv12_to_rgb(src),
            PixelFormat::Rgb24 => return Err(ConvertError::Unsupported(PixelFormat::Rgb24)),
        }

        self.out.pts_us = src.pts_us;
        Ok(&self.out)
    }

    fn yuv420p_to_rgb(&mut self, src: &VideoFrame) {
        let width = self.width as usize;
        let height = self.height as usize;
        let uv_width = width / 2;
        let y_plane = src.plane(0);
        let u_plane = src.plane(1);
        let v_plane = src.plane(2);

        for y in 0..height {
            let y_row = y * width;
            let uv_row = (y / 2) * uv_width;
            let dst_row = y * width * 3;

            for x in 0..width {
                let y_val = y_plane[y_row + x] as usize;
                let u_val = u_plane[uv_row + x / 2] as usize;
                let v_val = v_plane[uv_row + x / 2] as usize;
                self.store_pixel(dst_row + x * 3, y_val, u_val, v_val);
            }
        }
    }

    fn nv12_to_rgb(&mut self, src: &VideoFrame) {
        let width = self.width as usize;
        let height = self.height as usize;
        let y_plane = src.plane(0);
        let uv_plane = src.plane(1);

        for y in 0..height {
            let y_row = y * width;
            let uv_row = (y / 2) * width;
            let dst_row = y * width * 3;

            for x in 0..width {
                let y_val = y_plane[y_row + x] as usize;
                let uv_idx = uv_row + (x / 2) * 2;
                let u_val = uv_plane[uv_idx] as usize;
                let v_val = uv_plane[uv_idx + 1] as usize;
                self.store_pixel(dst_row + x * 3, y_val, u_val, v_val);
            }
        }
    }

    #[inline]
    fn store_pixel(&mut self, dst_idx: usize, y_val: usize, u_val: usize, v_val: usize) {
        let y_contrib = self.y_table[y_val];
        let r = (y_contrib + (self.v_table_r[v_val] >> 8)).clamp(0, 255) as u8;
        let g = (y_contrib + (self.u_table_g[u_val] >> 8) + (self.v_table_g[v_val] >> 8))
            .clamp(0, 255) as u8;
        let b = (y_contrib + (self.u_table_b[u_val] >> 8)).clamp(0, 255) as u8;

        self.out.data[dst_idx] = r;
        self.out.data[dst_idx + 1] = g;
        self.out.data[dst_idx + 2] = b;
    }
}

// ============================================================================
// Tests
// ============================================================================
