//! JPEG compression of decoded frames for the wire.

use crate::config::StreamingConfig;
use crate::decoder::{Frame, PixelFormat};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// A compressed frame ready to send.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub channels: usize,
}

impl EncodedFrame {
    /// `[height, width, channels]` of the encoded image.
    pub fn shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, self.channels]
    }
}

#[derive(Debug, Clone)]
pub struct FrameEncoder {
    quality: u8,
    downscale_above_bytes: usize,
    max_frame_bytes: usize,
}

impl From<&StreamingConfig> for FrameEncoder {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            quality: config.jpeg_quality,
            downscale_above_bytes: config.downscale_above_bytes,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl FrameEncoder {
    pub fn new(quality: u8, downscale_above_bytes: usize, max_frame_bytes: usize) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            downscale_above_bytes,
            max_frame_bytes,
        }
    }

    pub fn encode(&self, frame: &Frame) -> Result<EncodedFrame, EncodeError> {
        let size = frame.byte_len();
        if size > self.max_frame_bytes {
            return Err(EncodeError::TooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }

        let channels = frame.format.channels();
        let (width, height) = if size > self.downscale_above_bytes {
            let factor = (self.downscale_above_bytes as f64 / size as f64).sqrt();
            let width = ((frame.width as f64 * factor) as u32).max(1);
            let height = ((frame.height as f64 * factor) as u32).max(1);
            debug!(
                from_width = frame.width,
                from_height = frame.height,
                to_width = width,
                to_height = height,
                "Downscaling large frame"
            );
            (width, height)
        } else {
            (frame.width, frame.height)
        };

        let mut pixels = resize_nearest(&frame.data, frame.width, frame.height, width, height, channels);
        let color = match frame.format {
            PixelFormat::Bgr8 => {
                for pixel in pixels.chunks_exact_mut(3) {
                    pixel.swap(0, 2);
                }
                ExtendedColorType::Rgb8
            }
            PixelFormat::Mono8 => ExtendedColorType::L8,
        };

        let mut out = Vec::with_capacity(pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode(&pixels, width, height, color)?;
        trace!(width = width, height = height, bytes = out.len(), "Frame encoded");

        Ok(EncodedFrame {
            data: Bytes::from(out),
            width,
            height,
            channels,
        })
    }
}

/// Nearest-neighbour resize of an interleaved 8-bit image.
fn resize_nearest(
    data: &[u8],
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    channels: usize,
) -> Vec<u8> {
    if src_width == dst_width && src_height == dst_height {
        return data.to_vec();
    }

    let mut output = vec![0u8; dst_width as usize * dst_height as usize * channels];
    let x_ratio = src_width as f32 / dst_width as f32;
    let y_ratio = src_height as f32 / dst_height as f32;

    for y in 0..dst_height {
        let src_y = ((y as f32 * y_ratio) as u32).min(src_height - 1);
        for x in 0..dst_width {
            let src_x = ((x as f32 * x_ratio) as u32).min(src_width - 1);

            let src_idx = (src_y as usize * src_width as usize + src_x as usize) * channels;
            let dst_idx = (y as usize * dst_width as usize + x as usize) * channels;
            if src_idx + channels <= data.len() {
                output[dst_idx..dst_idx + channels].copy_from_slice(&data[src_idx..src_idx + channels]);
            }
        }
    }

    output
}
