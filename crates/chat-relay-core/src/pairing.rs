//! Pairing-code rendering.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use qrcode::{QrCode, render::svg};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_DIMENSION: u32 = 256;

/// Render error.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Pairing token is empty")]
    Empty,
    #[error("Failed to encode pairing token: {0}")]
    Encode(#[from] qrcode::types::QrError),
}

/// Displayable QR code for a pairing token, as a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingImage(String);

impl PairingImage {
    /// Render a raw pairing token as an SVG QR code.
    ///
    /// Rendering is deterministic: the same token always yields the same image.
    ///
    /// # Errors
    /// Returns error if the token is empty or too long to encode.
    pub fn render(token: &str) -> Result<Self, RenderError> {
        if token.is_empty() {
            return Err(RenderError::Empty);
        }
        let svg = QrCode::new(token.as_bytes())?
            .render::<svg::Color>()
            .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build();

        Ok(Self(format!(
            "data:image/svg+xml;base64,{}",
            BASE64.encode(svg.as_bytes())
        )))
    }

    #[must_use]
    pub fn as_data_uri(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_data_uri(self) -> String {
        self.0
    }
}
