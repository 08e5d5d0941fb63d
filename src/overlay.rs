//! Wall-clock overlay burned into recorded frames.

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const MARGIN: u32 = 4;

/// Text stamped onto a frame for `timestamp`.
pub fn timestamp_label(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string()
}

/// Draw the capture time in the top-left corner of `image`.
///
/// Glyphs scale with the frame height so the stamp stays legible on large
/// sensors without covering small previews.
pub fn stamp_timestamp(image: &mut RgbImage, timestamp: &DateTime<Utc>) {
    let label = timestamp_label(timestamp);
    let scale = (image.height() / 240).max(1);
    let advance = (GLYPH_WIDTH + 1) * scale;

    #[allow(clippy::cast_possible_truncation)]
    let text_width = advance * label.chars().count() as u32;
    let box_right = (MARGIN * 2 + text_width).min(image.width());
    let box_bottom = (MARGIN * 2 + GLYPH_HEIGHT * scale).min(image.height());
    fill_rect(image, 0, 0, box_right, box_bottom, Rgb([0, 0, 0]));

    let mut x = MARGIN;
    for ch in label.chars() {
        if let Some(rows) = glyph_bits(ch) {
            draw_glyph(image, x, MARGIN, scale, rows, Rgb([255, 255, 255]));
        }
        x += advance;
    }
}

fn fill_rect(image: &mut RgbImage, left: u32, top: u32, right: u32, bottom: u32, color: Rgb<u8>) {
    for y in top..bottom.min(image.height()) {
        for x in left..right.min(image.width()) {
            image.put_pixel(x, y, color);
        }
    }
}

fn draw_glyph(image: &mut RgbImage, x: u32, y: u32, scale: u32, rows: [u8; 7], color: Rgb<u8>) {
    for (row, pattern) in (0u32..).zip(rows) {
        for col in 0..GLYPH_WIDTH {
            if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                continue;
            }
            for dy in 0..scale {
                for dx in 0..scale {
                    let px = x + col * scale + dx;
                    let py = y + row * scale + dy;
                    if px < image.width() && py < image.height() {
                        image.put_pixel(px, py, color);
                    }
                }
            }
        }
    }
}

const fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '-' => Some([0, 0, 0, 0b11111, 0, 0, 0]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 5)
            .single()
            .expect("valid time")
    }

    #[test]
    fn test_label_has_millisecond_precision() {
        assert_eq!(timestamp_label(&sample_time()), "2024-05-17 08:30:05.000 UTC");
    }

    #[test]
    fn test_stamp_draws_into_corner_only() {
        let mut image = RgbImage::from_pixel(640, 480, Rgb([90, 90, 90]));
        stamp_timestamp(&mut image, &sample_time());

        let lit = image.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        assert!(lit > 0, "no glyph pixels drawn");
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(639, 479).0, [90, 90, 90]);
    }

    #[test]
    fn test_stamp_tolerates_tiny_frames() {
        let mut image = RgbImage::from_pixel(8, 4, Rgb([10, 10, 10]));
        stamp_timestamp(&mut image, &sample_time());
        assert_eq!(image.dimensions(), (8, 4));
    }
}
