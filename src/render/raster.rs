//! Deterministic raster painting and encoding.
//!
//! Paints a month-style grid from the render context: a header band tinted
//! per config, 7×5 day cells covering five weeks around "now", and one bar
//! per event in its day cell, colored by source. No fonts, no layout
//! engine. Every pixel is a pure function of the context, so identical
//! inputs produce identical bytes.

use std::io::Cursor;

use chrono::{DateTime, Datelike, Duration, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::checksum;
use crate::config::ImageType;
use crate::errors::GenerateError;

use super::{Raster, RasterOptions};

const HEADER_FRACTION: u32 = 8; // header height = image height / 8
const GRID_COLS: u32 = 7;
const GRID_ROWS: u32 = 5;
const CELL_PADDING: u32 = 2;
const MAX_BARS_PER_CELL: usize = 6;

/// Paint the grid for `context` and encode it per `options`.
///
/// # Errors
///
/// `RasterFailed` when the context is malformed or encoding fails.
pub fn paint_and_encode(
    context: &serde_json::Value,
    options: &RasterOptions,
) -> Result<Raster, GenerateError> {
    let now = context
        .get("now")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| GenerateError::RasterFailed {
            source: anyhow::anyhow!("render context carries no 'now' timestamp"),
        })?;
    let id = context.get("id").and_then(serde_json::Value::as_str).unwrap_or("");
    let empty = Vec::new();
    let events = context
        .get("events")
        .and_then(serde_json::Value::as_array)
        .unwrap_or(&empty);

    let image = paint(id, events, now, options.width, options.height);
    let image = post_process(image, options);
    encode(&image, options.image_type)
}

/// Paint the base RGB image.
fn paint(id: &str, events: &[serde_json::Value], now: DateTime<Utc>, width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb([250, 250, 248]));

    // Header band tinted from the config id.
    let header_height = (height / HEADER_FRACTION).max(8);
    let header = tint(checksum::crc32(id.as_bytes()), 60);
    fill_rect(&mut image, 0, 0, width, header_height, header);

    // The grid covers five weeks starting on the Monday of last week.
    let today = now.date_naive();
    let monday = today
        - Duration::days(i64::from(today.weekday().num_days_from_monday()))
        - Duration::days(7);

    let grid_top = header_height + CELL_PADDING;
    let grid_height = height.saturating_sub(grid_top);
    let cell_w = width / GRID_COLS;
    let cell_h = grid_height / GRID_ROWS;
    if cell_w < 2 * CELL_PADDING + 1 || cell_h < 2 * CELL_PADDING + 1 {
        return image;
    }

    for row in 0..GRID_ROWS {
        for col in 0..GRID_COLS {
            let date = monday + Duration::days(i64::from(row * GRID_COLS + col));
            let x = col * cell_w + CELL_PADDING;
            let y = grid_top + row * cell_h + CELL_PADDING;
            let w = cell_w - 2 * CELL_PADDING;
            let h = cell_h - 2 * CELL_PADDING;

            let cell_color = if date == today {
                Rgb([255, 244, 214])
            } else {
                Rgb([255, 255, 255])
            };
            fill_rect(&mut image, x, y, w, h, cell_color);

            // One bar per event starting on this date, stacked downward.
            let day_events: Vec<&serde_json::Value> = events
                .iter()
                .filter(|event| {
                    event
                        .get("start")
                        .and_then(serde_json::Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .is_some_and(|start| start.with_timezone(&Utc).date_naive() == date)
                })
                .take(MAX_BARS_PER_CELL)
                .collect();

            let bar_h = (h / (MAX_BARS_PER_CELL as u32 + 1)).max(2);
            for (slot, event) in day_events.iter().enumerate() {
                let label = format!(
                    "{}|{}",
                    event.get("summary").and_then(serde_json::Value::as_str).unwrap_or(""),
                    event.get("sourceName").and_then(serde_json::Value::as_str).unwrap_or(""),
                );
                let color = tint(checksum::crc32(label.as_bytes()), 110);
                let bar_y = y + 1 + slot as u32 * (bar_h + 1);
                if bar_y + bar_h <= y + h {
                    fill_rect(&mut image, x + 1, bar_y, w.saturating_sub(2), bar_h, color);
                }
            }
        }
    }

    image
}

/// Grayscale, bit-depth quantization, and rotation, in that order.
fn post_process(image: RgbImage, options: &RasterOptions) -> DynamicImage {
    let mut dynamic = DynamicImage::ImageRgb8(image);

    if options.grayscale {
        dynamic = DynamicImage::ImageRgb8(dynamic.grayscale().into_rgb8());
    }

    if options.bit_depth < 8 {
        let levels = (1u16 << options.bit_depth) - 1;
        let mut rgb = dynamic.into_rgb8();
        for pixel in rgb.pixels_mut() {
            for channel in &mut pixel.0 {
                *channel = quantize(*channel, levels);
            }
        }
        dynamic = DynamicImage::ImageRgb8(rgb);
    }

    match options.rotate {
        90 => dynamic.rotate90(),
        180 => dynamic.rotate180(),
        270 => dynamic.rotate270(),
        _ => dynamic,
    }
}

fn quantize(value: u8, levels: u16) -> u8 {
    if levels == 0 {
        return 0;
    }
    let scaled = (u16::from(value) * levels + 127) / 255;
    ((scaled * 255) / levels) as u8
}

fn encode(image: &DynamicImage, image_type: ImageType) -> Result<Raster, GenerateError> {
    let format = match image_type {
        ImageType::Png => ImageFormat::Png,
        ImageType::Jpg => ImageFormat::Jpeg,
        ImageType::Bmp => ImageFormat::Bmp,
    };
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, format)
        .map_err(|e| GenerateError::RasterFailed { source: e.into() })?;
    Ok(Raster {
        bytes: cursor.into_inner(),
        content_type: image_type.content_type().to_owned(),
    })
}

/// Map a hash to a readable color with roughly constant lightness.
fn tint(hash: u32, base: u8) -> Rgb<u8> {
    let r = base.wrapping_add((hash & 0x7F) as u8);
    let g = base.wrapping_add(((hash >> 8) & 0x7F) as u8);
    let b = base.wrapping_add(((hash >> 16) & 0x7F) as u8);
    Rgb([r, g, b])
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    for py in y..(y + h).min(height) {
        for px in x..(x + w).min(width) {
            image.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context(events: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "id": "kitchen",
            "now": Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap().to_rfc3339(),
            "events": events,
        })
    }

    fn options(image_type: ImageType) -> RasterOptions {
        RasterOptions {
            width: 280,
            height: 200,
            image_type,
            grayscale: false,
            bit_depth: 8,
            rotate: 0,
        }
    }

    #[test]
    fn png_output_carries_signature() {
        let raster = paint_and_encode(&context(serde_json::json!([])), &options(ImageType::Png)).unwrap();
        assert_eq!(&raster.bytes[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
        assert_eq!(raster.content_type, "image/png");
    }

    #[test]
    fn bmp_and_jpeg_magic_bytes() {
        let bmp = paint_and_encode(&context(serde_json::json!([])), &options(ImageType::Bmp)).unwrap();
        assert_eq!(&bmp.bytes[..2], b"BM");
        assert_eq!(bmp.content_type, "image/bmp");

        let jpg = paint_and_encode(&context(serde_json::json!([])), &options(ImageType::Jpg)).unwrap();
        assert_eq!(&jpg.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(jpg.content_type, "image/jpeg");
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let mut opts = options(ImageType::Png);
        opts.rotate = 90;
        let raster = paint_and_encode(&context(serde_json::json!([])), &opts).unwrap();
        let decoded = image::load_from_memory(&raster.bytes).unwrap();
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 280);
    }

    #[test]
    fn events_change_the_output() {
        let empty = paint_and_encode(&context(serde_json::json!([])), &options(ImageType::Png)).unwrap();
        let busy = paint_and_encode(
            &context(serde_json::json!([
                { "summary": "Standup", "start": "2024-06-05T09:00:00Z" }
            ])),
            &options(ImageType::Png),
        )
        .unwrap();
        assert_ne!(empty.bytes, busy.bytes);
    }

    #[test]
    fn painting_is_deterministic() {
        let ctx = context(serde_json::json!([
            { "summary": "Standup", "start": "2024-06-05T09:00:00Z", "sourceName": "work" }
        ]));
        let a = paint_and_encode(&ctx, &options(ImageType::Png)).unwrap();
        let b = paint_and_encode(&ctx, &options(ImageType::Png)).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn missing_now_is_raster_failed() {
        let err = paint_and_encode(&serde_json::json!({"id": "x"}), &options(ImageType::Png))
            .unwrap_err();
        assert_eq!(err.kind(), "RasterFailed");
    }

    #[test]
    fn quantize_is_monotonic_and_bounded() {
        for depth in 1..8u8 {
            let levels = (1u16 << depth) - 1;
            let mut last = 0;
            for v in 0..=255u8 {
                let q = quantize(v, levels);
                assert!(q >= last);
                last = q;
            }
            assert_eq!(quantize(0, levels), 0);
            assert_eq!(quantize(255, levels), 255);
        }
    }
}
