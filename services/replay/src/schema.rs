//! Protobuf payload types carried by recording channels.
//!
//! Field tags follow the published foxglove schemas so payloads written by
//! any foxglove-compatible recorder decode without generated code.

/// Schema name of uncompressed image channels.
pub const RAW_IMAGE: &str = "foxglove.RawImage";
/// Schema name of compressed video channels.
pub const COMPRESSED_VIDEO: &str = "foxglove.CompressedVideo";
/// Schema names of camera calibration channels.
pub const CALIBRATION_SCHEMAS: [&str; 2] = ["foxglove.CameraCalibration", "robot_data.CameraParameters"];
/// Schema names of video channels.
pub const VIDEO_SCHEMAS: [&str; 2] = [RAW_IMAGE, COMPRESSED_VIDEO];

/// An uncompressed image.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawImage {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "7")]
    pub frame_id: String,
    #[prost(fixed32, tag = "2")]
    pub width: u32,
    #[prost(fixed32, tag = "3")]
    pub height: u32,
    /// Pixel encoding, e.g. `rgb8`, `bgr8`, `mono8`
    #[prost(string, tag = "4")]
    pub encoding: String,
    /// Row length in bytes
    #[prost(fixed32, tag = "5")]
    pub step: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub data: Vec<u8>,
}

/// A single access unit of a compressed video stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CompressedVideo {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub frame_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    /// Codec name, e.g. `h264`
    #[prost(string, tag = "4")]
    pub format: String,
}

/// Free-text annotation attached to a point in time.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TextAnnotation {
    #[prost(string, tag = "1")]
    pub data: String,
}
