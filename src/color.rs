//! Color values used by scripts and frames

use thiserror::Error;

/// 8-bit RGB color, as sent on the wire
pub type ColorRgb = palette::rgb::LinSrgb<u8>;

#[derive(Debug, Error)]
pub enum ColorParseError {
    #[error("expected 6 hex digits, got {0} characters")]
    InvalidLength(usize),
    #[error("invalid hex color: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Operations on [ColorRgb] values
pub trait ColorRgbExt: Sized {
    /// Build a color from integer channels. Values outside of 0..=255 wrap around, so 256 becomes 0.
    fn from_channels(red: i64, green: i64, blue: i64) -> Self;

    /// All channels off
    fn off() -> Self;

    /// Multiply every channel by `factor`, truncating the result
    fn dim(self, factor: f64) -> Self;

    /// Lowercase `rrggbb` representation
    fn to_hex(&self) -> String;

    /// Parse a `rrggbb` string, case-insensitive
    fn parse_hex(s: &str) -> Result<Self, ColorParseError>;
}

fn wrap_channel(value: i64) -> u8 {
    value as u8
}

fn dim_channel(value: u8, factor: f64) -> u8 {
    wrap_channel((f64::from(value) * factor) as i64)
}

impl ColorRgbExt for ColorRgb {
    fn from_channels(red: i64, green: i64, blue: i64) -> Self {
        Self::new(wrap_channel(red), wrap_channel(green), wrap_channel(blue))
    }

    fn off() -> Self {
        Self::new(0, 0, 0)
    }

    fn dim(self, factor: f64) -> Self {
        Self::new(
            dim_channel(self.red, factor),
            dim_channel(self.green, factor),
            dim_channel(self.blue, factor),
        )
    }

    fn to_hex(&self) -> String {
        hex::encode([self.red, self.green, self.blue])
    }

    fn parse_hex(s: &str) -> Result<Self, ColorParseError> {
        if s.len() != 6 {
            return Err(ColorParseError::InvalidLength(s.len()));
        }

        let mut channels = [0u8; 3];
        hex::decode_to_slice(s, &mut channels)?;
        Ok(Self::new(channels[0], channels[1], channels[2]))
    }
}

/// HSV color. Hue is in degrees, saturation and value are normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorHsv {
    hue: f64,
    saturation: f64,
    value: f64,
}

impl ColorHsv {
    /// Create a new HSV color, clamping every component to its range
    pub fn new(hue: f64, saturation: f64, value: f64) -> Self {
        Self {
            hue: hue.clamp(0.0, 360.0),
            saturation: saturation.clamp(0.0, 1.0),
            value: value.clamp(0.0, 1.0),
        }
    }

    pub fn hue(&self) -> f64 {
        self.hue
    }

    pub fn saturation(&self) -> f64 {
        self.saturation
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Scale the value component, clamped like a freshly built color
    pub fn dim(&self, factor: f64) -> Self {
        Self::new(self.hue, self.saturation, self.value * factor)
    }

    pub fn to_rgb(&self) -> ColorRgb {
        let h = self.hue / 60.0;
        let sector = h.floor();
        let f = h - sector;

        let v = self.value;
        let p = v * (1.0 - self.saturation);
        let q = v * (1.0 - f * self.saturation);
        let t = v * (1.0 - (1.0 - f) * self.saturation);

        let (r, g, b) = match sector as i64 % 6 {
            1 => (q, v, p),
            2 => (p, v, t),
            3 => (p, q, v),
            4 => (t, p, v),
            5 => (v, p, q),
            _ => (v, t, p),
        };

        ColorRgb::new(
            (r * 255.0) as u8,
            (g * 255.0) as u8,
            (b * 255.0) as u8,
        )
    }
}

impl From<ColorHsv> for ColorRgb {
    fn from(hsv: ColorHsv) -> Self {
        hsv.to_rgb()
    }
}
