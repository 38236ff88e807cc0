//! QR code rendering for lure URLs

use super::context::ContextError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use std::io::Cursor;

/// A rendered QR code ready to attach inline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrImage {
    /// PNG bytes, standard base64
    pub base64: String,
    /// Attachment file name, also used as the Content-ID
    pub name: String,
}

impl QrImage {
    /// Render `text` as a PNG QR code at least `size` pixels wide
    pub fn render(text: &str, size: &str) -> Result<Self, ContextError> {
        let size: u32 = size
            .trim()
            .parse()
            .map_err(|_| ContextError::Qr(format!("invalid QR size: {:?}", size)))?;
        if size == 0 {
            return Err(ContextError::Qr("QR size must be positive".to_string()));
        }

        let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::M)
            .map_err(|e| ContextError::Qr(e.to_string()))?;
        let image = code
            .render::<Luma<u8>>()
            .min_dimensions(size, size)
            .build();

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| ContextError::Qr(e.to_string()))?;

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        Ok(Self {
            base64: STANDARD.encode(&png),
            name: format!("qr_{}.png", nanos),
        })
    }

    /// `<img>` tag referencing the inline attachment
    pub fn html(&self) -> String {
        format!("<img src=\"cid:{}\">", self.name)
    }

    /// Decoded PNG bytes
    pub fn png(&self) -> Result<Vec<u8>, ContextError> {
        STANDARD
            .decode(&self.base64)
            .map_err(|e| ContextError::Qr(e.to_string()))
    }
}
