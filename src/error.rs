//! Error type shared by all keyplay modules.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to access HID: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("no device found for {vendor_id:04x}:{product_id:04x} (root permissions required)")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("{0}")]
    Unsupported(String),

    #[error("device reported no LED positions")]
    NoLeds,

    #[error("video file not found: {}", .0.display())]
    VideoNotFound(PathBuf),

    #[error("video decoding failed: {0}")]
    Decode(String),

    #[error("invalid layout file {}: {reason}", .path.display())]
    Layout { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
