//! Hex color parsing for drawing commands and configuration.

use crate::error::{DisplayError, Result};
use image::Rgba;

/// Parse `#RGB`, `#ARGB`, `#RRGGBB` or `#AARRGGBB` (leading `#` optional)
/// into an RGBA pixel. Omitted alpha is opaque.
pub fn parse_color(spec: &str) -> Result<Rgba<u8>> {
    let hex = spec.trim().trim_start_matches('#');
    let digits: Vec<u8> = hex
        .chars()
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| DisplayError::validation("color", format!("not a hex color: {spec}")))
        })
        .collect::<Result<_>>()?;

    let (a, r, g, b) = match digits.len() {
        3 => (
            0xff,
            digits[0] * 17,
            digits[1] * 17,
            digits[2] * 17,
        ),
        4 => (
            digits[0] * 17,
            digits[1] * 17,
            digits[2] * 17,
            digits[3] * 17,
        ),
        6 => (
            0xff,
            digits[0] * 16 + digits[1],
            digits[2] * 16 + digits[3],
            digits[4] * 16 + digits[5],
        ),
        8 => (
            digits[0] * 16 + digits[1],
            digits[2] * 16 + digits[3],
            digits[4] * 16 + digits[5],
            digits[6] * 16 + digits[7],
        ),
        _ => {
            return Err(DisplayError::validation(
                "color",
                format!("not a hex color: {spec}"),
            ))
        }
    };
    Ok(Rgba([r, g, b, a]))
}

/// True when `spec` parses as a bare color (used to decide whether a draw
/// fragment is a solid fill or a vector fragment).
pub fn is_color(spec: &str) -> bool {
    parse_color(spec).is_ok()
}

/// Format a pixel back into `#RRGGBB` / `#AARRGGBB` form.
pub fn format_color(color: Rgba<u8>) -> String {
    let Rgba([r, g, b, a]) = color;
    if a == 0xff {
        format!("#{r:02X}{g:02X}{b:02X}")
    } else {
        format!("#{a:02X}{r:02X}{g:02X}{b:02X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_color("#FFFFFF").unwrap(), Rgba([255, 255, 255, 255]));
        assert_eq!(parse_color("000000").unwrap(), Rgba([0, 0, 0, 255]));
        assert_eq!(parse_color("#80FF0000").unwrap(), Rgba([255, 0, 0, 0x80]));
        assert_eq!(parse_color("#F0A").unwrap(), Rgba([255, 0, 170, 255]));
    }

    #[test]
    fn rejects_junk() {
        assert!(parse_color("red").is_err());
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("").is_err());
        assert!(!is_color("<rect width=\"4\"/>"));
        assert!(is_color("#123456"));
    }

    #[test]
    fn round_trips_through_format() {
        for spec in ["#102030", "#80102030"] {
            let color = parse_color(spec).unwrap();
            assert_eq!(format_color(color), spec);
        }
    }
}
