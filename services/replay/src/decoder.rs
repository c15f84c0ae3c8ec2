//! Payload decoding into normalized pixel buffers.
//!
//! Raw images are reshaped (and reordered to BGR); compressed video access
//! units are decoded through a short-lived GStreamer pipeline.

use crate::config::ContainerConfig;
use crate::schema::{CompressedVideo, RawImage, COMPRESSED_VIDEO, RAW_IMAGE};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use prost::Message as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors that can occur while decoding one payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] prost::DecodeError),

    #[error("Image data too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Image dimensions overflow: {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error("Unsupported {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },

    #[error("Video decoder failed: {0}")]
    Codec(String),

    #[error("Video decoder produced no frame")]
    NoFrame,
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr8,
    Mono8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 => 3,
            PixelFormat::Mono8 => 1,
        }
    }
}

/// A decoded image, tightly packed (no row padding).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Frame {
    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        [
            self.height as usize,
            self.width as usize,
            self.format.channels(),
        ]
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Decoder statistics.
#[derive(Debug, Default, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub decode_failures: u64,
}

/// Turns channel payloads into [`Frame`]s.
pub struct FrameDecoder {
    h264_timeout: Duration,
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(&ContainerConfig::default())
    }
}

impl FrameDecoder {
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            h264_timeout: config.h264_timeout(),
            frames_decoded: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Decode a payload. Failures are logged and yield `None`.
    pub fn decode(&self, schema_name: &str, payload: &[u8]) -> Option<Frame> {
        match self.try_decode(schema_name, payload) {
            Ok(frame) => {
                self.frames_decoded.fetch_add(1, Ordering::Relaxed);
                trace!(
                    schema = %schema_name,
                    width = frame.width,
                    height = frame.height,
                    "Payload decoded"
                );
                Some(frame)
            }
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(schema = %schema_name, error = %e, "Payload not decoded");
                None
            }
        }
    }

    /// Decode a payload, reporting why it failed.
    pub fn try_decode(&self, schema_name: &str, payload: &[u8]) -> Result<Frame, DecodeError> {
        match schema_name {
            RAW_IMAGE => decode_raw_image(&RawImage::decode(payload)?),
            COMPRESSED_VIDEO => {
                let video = CompressedVideo::decode(payload)?;
                match video.format.to_lowercase().as_str() {
                    "h264" => decode_h264(&video.data, self.h264_timeout),
                    _ => Err(DecodeError::Unsupported {
                        kind: "video format",
                        value: video.format,
                    }),
                }
            }
            other => Err(DecodeError::Unsupported {
                kind: "schema",
                value: other.to_string(),
            }),
        }
    }
}

/// Reshape a raw image, stripping row padding and reordering RGB to BGR.
pub fn decode_raw_image(image: &RawImage) -> Result<Frame, DecodeError> {
    let format = match image.encoding.to_lowercase().as_str() {
        "rgb8" | "bgr8" => PixelFormat::Bgr8,
        "mono8" => PixelFormat::Mono8,
        _ => {
            return Err(DecodeError::Unsupported {
                kind: "image encoding",
                value: image.encoding.clone(),
            })
        }
    };
    let swap_red_blue = image.encoding.eq_ignore_ascii_case("rgb8");

    let overflow = || DecodeError::Dimensions {
        width: image.width,
        height: image.height,
    };
    let row_len = (image.width as usize)
        .checked_mul(format.channels())
        .ok_or_else(overflow)?;
    let step = (image.step as usize).max(row_len);
    let height = image.height as usize;
    let expected = match height.checked_sub(1) {
        None => 0,
        Some(last_row) => step
            .checked_mul(last_row)
            .and_then(|offset| offset.checked_add(row_len))
            .ok_or_else(overflow)?,
    };
    let packed_len = row_len.checked_mul(height).ok_or_else(overflow)?;
    if image.data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: image.data.len(),
        });
    }

    let mut data = Vec::with_capacity(packed_len);
    for row in 0..height {
        let start = row * step;
        data.extend_from_slice(&image.data[start..start + row_len]);
    }

    if swap_red_blue {
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
    }

    Ok(Frame {
        width: image.width,
        height: image.height,
        format,
        data: Bytes::from(data),
    })
}

/// Decode one H.264 access unit and keep the first reconstructed frame.
fn decode_h264(data: &[u8], timeout: Duration) -> Result<Frame, DecodeError> {
    gst::init().map_err(|e| DecodeError::Codec(e.to_string()))?;

    let pipeline = gst::parse::launch(
        "appsrc name=src format=bytes is-live=false \
         caps=video/x-h264,stream-format=byte-stream,alignment=au \
         ! h264parse ! avdec_h264 ! videoconvert \
         ! video/x-raw,format=BGR \
         ! appsink name=sink sync=false max-buffers=1",
    )
    .map_err(|e| DecodeError::Codec(e.to_string()))?
    .downcast::<gst::Pipeline>()
    .map_err(|_| DecodeError::Codec("Failed to cast to Pipeline".to_string()))?;

    let result = run_h264_pipeline(&pipeline, data, timeout);
    let _ = pipeline.set_state(gst::State::Null);
    result
}

fn run_h264_pipeline(
    pipeline: &gst::Pipeline,
    data: &[u8],
    timeout: Duration,
) -> Result<Frame, DecodeError> {
    let appsrc = pipeline
        .by_name("src")
        .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
        .ok_or_else(|| DecodeError::Codec("appsrc not found".to_string()))?;
    let appsink = pipeline
        .by_name("sink")
        .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
        .ok_or_else(|| DecodeError::Codec("appsink not found".to_string()))?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    appsrc
        .push_buffer(gst::Buffer::from_slice(data.to_vec()))
        .map_err(|e| DecodeError::Codec(e.to_string()))?;
    appsrc
        .end_of_stream()
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let sample = appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(timeout.as_millis() as u64))
        .ok_or(DecodeError::NoFrame)?;
    let caps = sample.caps().ok_or(DecodeError::NoFrame)?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| DecodeError::Codec(e.to_string()))?;
    let buffer = sample.buffer().ok_or(DecodeError::NoFrame)?;
    let map = buffer
        .map_readable()
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let width = info.width() as usize;
    let height = info.height() as usize;
    let stride = info.stride()[0] as usize;
    let row_len = width * 3;
    let bytes = map.as_slice();
    if stride < row_len || bytes.len() < stride * height.saturating_sub(1) + row_len {
        return Err(DecodeError::Truncated {
            expected: stride * height,
            actual: bytes.len(),
        });
    }

    let mut packed = Vec::with_capacity(row_len * height);
    for row in 0..height {
        packed.extend_from_slice(&bytes[row * stride..row * stride + row_len]);
    }

    Ok(Frame {
        width: width as u32,
        height: height as u32,
        format: PixelFormat::Bgr8,
        data: Bytes::from(packed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(width: u32, height: u32, encoding: &str, step: u32, data: Vec<u8>) -> Vec<u8> {
        RawImage {
            timestamp: None,
            frame_id: "cam".to_string(),
            width,
            height,
            encoding: encoding.to_string(),
            step,
            data,
        }
        .encode_to_vec()
    }

    #[test]
    fn test_rgb8_reordered_to_bgr() {
        let decoder = FrameDecoder::default();
        let payload = raw(2, 1, "rgb8", 6, vec![1, 2, 3, 4, 5, 6]);
        let frame = decoder.decode(RAW_IMAGE, &payload).unwrap();
        assert_eq!(frame.format, PixelFormat::Bgr8);
        assert_eq!(frame.shape(), [1, 2, 3]);
        assert_eq!(frame.data.as_ref(), &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_bgr8_reshaped_only() {
        let decoder = FrameDecoder::default();
        let payload = raw(1, 2, "BGR8", 3, vec![9, 8, 7, 6, 5, 4]);
        let frame = decoder.decode(RAW_IMAGE, &payload).unwrap();
        assert_eq!(frame.shape(), [2, 1, 3]);
        assert_eq!(frame.data.as_ref(), &[9, 8, 7, 6, 5, 4]);
    }

    #[test]
    fn test_mono8_with_row_padding() {
        let decoder = FrameDecoder::default();
        let payload = raw(2, 2, "mono8", 4, vec![1, 2, 0, 0, 3, 4, 0, 0]);
        let frame = decoder.decode(RAW_IMAGE, &payload).unwrap();
        assert_eq!(frame.format, PixelFormat::Mono8);
        assert_eq!(frame.shape(), [2, 2, 1]);
        assert_eq!(frame.data.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_encoding_yields_none() {
        let decoder = FrameDecoder::default();
        let payload = raw(1, 1, "yuv422", 2, vec![0, 0]);
        assert!(decoder.decode(RAW_IMAGE, &payload).is_none());

        // processing continues with the next payload
        let payload = raw(1, 1, "mono8", 1, vec![42]);
        assert!(decoder.decode(RAW_IMAGE, &payload).is_some());

        let stats = decoder.stats();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.frames_decoded, 1);
    }

    #[test]
    fn test_truncated_image() {
        let decoder = FrameDecoder::default();
        let payload = raw(4, 4, "mono8", 4, vec![0; 10]);
        assert!(matches!(
            decoder.try_decode(RAW_IMAGE, &payload),
            Err(DecodeError::Truncated { expected: 16, actual: 10 })
        ));
    }

    #[test]
    fn test_oversized_dimensions_rejected() {
        let decoder = FrameDecoder::default();
        let payload = raw(u32::MAX, u32::MAX, "bgr8", 0, vec![0; 16]);
        assert!(matches!(
            decoder.try_decode(RAW_IMAGE, &payload),
            Err(DecodeError::Dimensions { .. })
        ));

        // huge but representable dimensions fail the length check
        let payload = raw(u32::MAX, 2, "mono8", 0, vec![0; 16]);
        assert!(matches!(
            decoder.try_decode(RAW_IMAGE, &payload),
            Err(DecodeError::Truncated { actual: 16, .. })
        ));
        assert!(decoder.decode(RAW_IMAGE, &payload).is_none());
    }

    #[test]
    fn test_unsupported_video_format() {
        let decoder = FrameDecoder::default();
        let payload = CompressedVideo {
            timestamp: None,
            frame_id: "cam".to_string(),
            data: vec![0, 0, 0, 1],
            format: "h265".to_string(),
        }
        .encode_to_vec();
        assert!(matches!(
            decoder.try_decode(COMPRESSED_VIDEO, &payload),
            Err(DecodeError::Unsupported { kind: "video format", .. })
        ));
    }

    #[test]
    fn test_unknown_schema() {
        let decoder = FrameDecoder::default();
        assert!(decoder.decode("foxglove.PointCloud", &[]).is_none());
    }

    #[test]
    fn test_malformed_payload() {
        let decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.try_decode(RAW_IMAGE, &[0xff, 0xff, 0xff]),
            Err(DecodeError::Payload(_))
        ));
    }
}
