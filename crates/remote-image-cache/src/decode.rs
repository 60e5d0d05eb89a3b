//! Cheap validation that a payload is an image we can decode

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::error::LoadError;

/// Format and dimensions read from an image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Sniff the format and parse the header without decoding pixels
pub fn probe(bytes: &[u8]) -> Result<ImageInfo, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::EmptyBody);
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let format = reader
        .format()
        .ok_or_else(|| LoadError::Decode("unrecognized image format".to_string()))?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    if width == 0 || height == 0 {
        return Err(LoadError::Decode(format!(
            "image has no pixels ({}x{})",
            width, height
        )));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
    })
}
