//! Colour values for bulb data points.
//!
//! Bulbs take their colour as a hex string written into a control data
//! point. Two encodings exist:
//!
//! ```text
//! rgb8   rrggbb0hhhssvv   r,g,b 0-255; h 0-360, s,v 0-255
//! hsv16  hhhhssssvvvv     h 0-360, s,v 0-1000
//! ```
//!
//! Older firmware also reports the bare six character `rrggbb` form.
//! Conversions truncate like the firmware does, so `hsv16` saturation and
//! value lose precision below 1/1000.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Hex encoding of a colour data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    /// `rrggbb0hhhssvv` (or `rrggbb`).
    Rgb8,
    /// `hhhhssssvvvv`.
    Hsv16,
}

impl ColorFormat {
    /// Picks the format from the length of `hexvalue`.
    pub fn detect(hexvalue: &str) -> Result<Self> {
        match hexvalue.len() {
            6 | 14 => Ok(ColorFormat::Rgb8),
            12 => Ok(ColorFormat::Hsv16),
            len => Err(ProtocolError::MalformedPayload(format!(
                "colour value of {} characters is neither rgb8 nor hsv16",
                len
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorFormat::Rgb8 => "rgb8",
            ColorFormat::Hsv16 => "hsv16",
        }
    }
}

impl FromStr for ColorFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rgb8" => Ok(ColorFormat::Rgb8),
            "hsv16" => Ok(ColorFormat::Hsv16),
            other => Err(ProtocolError::MalformedPayload(format!(
                "unknown colour format: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes an RGB colour.
pub fn rgb_to_hexvalue(r: u8, g: u8, b: u8, format: ColorFormat) -> String {
    encode(f64::from(r), f64::from(g), f64::from(b), format)
}

/// Encodes an HSV colour with every component in `0.0..=1.0`.
///
/// For `rgb8` the RGB part is truncated to whole values.
pub fn hsv_to_hexvalue(h: f64, s: f64, v: f64, format: ColorFormat) -> String {
    let (r, g, b) = hsv_to_rgb(h, s, v);
    encode(r * 255.0, g * 255.0, b * 255.0, format)
}

/// Decodes a colour value to RGB. `format` is detected from the length
/// when not given.
pub fn hexvalue_to_rgb(hexvalue: &str, format: Option<ColorFormat>) -> Result<(u8, u8, u8)> {
    let format = resolve(hexvalue, format)?;
    let bytes = decode_hex(hexvalue, format)?;
    match format {
        ColorFormat::Rgb8 => Ok((bytes[0], bytes[1], bytes[2])),
        ColorFormat::Hsv16 => {
            let (h, s, v) = hsv16_components(&bytes);
            let (r, g, b) = hsv_to_rgb(h, s, v);
            Ok((channel(r), channel(g), channel(b)))
        }
    }
}

/// Decodes a colour value to HSV with every component in `0.0..=1.0`.
pub fn hexvalue_to_hsv(hexvalue: &str, format: Option<ColorFormat>) -> Result<(f64, f64, f64)> {
    let format = resolve(hexvalue, format)?;
    let bytes = decode_hex(hexvalue, format)?;
    match format {
        ColorFormat::Rgb8 if bytes.len() == 7 => {
            // Hue is the low nibble of byte 3 and all of byte 4.
            let hue = u16::from_be_bytes([bytes[3] & 0x0f, bytes[4]]);
            Ok((
                f64::from(hue) / 360.0,
                f64::from(bytes[5]) / 255.0,
                f64::from(bytes[6]) / 255.0,
            ))
        }
        ColorFormat::Rgb8 => Ok(rgb_to_hsv(
            f64::from(bytes[0]) / 255.0,
            f64::from(bytes[1]) / 255.0,
            f64::from(bytes[2]) / 255.0,
        )),
        ColorFormat::Hsv16 => Ok(hsv16_components(&bytes)),
    }
}

fn encode(r: f64, g: f64, b: f64, format: ColorFormat) -> String {
    let (h, s, v) = rgb_to_hsv(r / 255.0, g / 255.0, b / 255.0);
    match format {
        ColorFormat::Rgb8 => format!(
            "{:02x}{:02x}{:02x}{:04x}{:02x}{:02x}",
            r as u8,
            g as u8,
            b as u8,
            (h * 360.0) as u16,
            (s * 255.0) as u8,
            (v * 255.0) as u8,
        ),
        ColorFormat::Hsv16 => format!(
            "{:04x}{:04x}{:04x}",
            (h * 360.0) as u16,
            (s * 1000.0) as u16,
            (v * 1000.0) as u16,
        ),
    }
}

fn resolve(hexvalue: &str, format: Option<ColorFormat>) -> Result<ColorFormat> {
    match format {
        Some(format) => Ok(format),
        None => ColorFormat::detect(hexvalue),
    }
}

fn decode_hex(hexvalue: &str, format: ColorFormat) -> Result<Vec<u8>> {
    let valid = match format {
        ColorFormat::Rgb8 => matches!(hexvalue.len(), 6 | 14),
        ColorFormat::Hsv16 => hexvalue.len() == 12,
    };
    if !valid {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} colour value has {} characters",
            format,
            hexvalue.len()
        )));
    }
    hex::decode(hexvalue)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid colour value: {}", e)))
}

fn hsv16_components(bytes: &[u8]) -> (f64, f64, f64) {
    let word = |i: usize| f64::from(u16::from_be_bytes([bytes[i], bytes[i + 1]]));
    (word(0) / 360.0, word(2) / 1000.0, word(4) / 1000.0)
}

fn channel(component: f64) -> u8 {
    (component * 255.0) as u8
}

fn rgb_to_hsv(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max == min {
        return (0.0, 0.0, max);
    }
    let range = max - min;
    let s = range / max;
    let rc = (max - r) / range;
    let gc = (max - g) / range;
    let bc = (max - b) / range;
    let h = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    ((h / 6.0).rem_euclid(1.0), s, max)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (v, v, v);
    }
    let sector = (h * 6.0).trunc();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (sector as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}
