use image::{imageops, DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

use crate::database::Character;
use crate::error::{PipelineError, Result};
use crate::settings::Settings;
use crate::storage::{decode_base64_image, encode_data_url};

/// Horizontal position a character occupies on the composite canvas.
/// Slot assignment is what keeps the rendered prompt spatially
/// consistent with the stitched reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Left,
    Middle,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Horizontal,
    Vertical,
}

/// Result of stitching character avatars into one reference canvas.
#[derive(Debug, Clone)]
pub struct CompositeReference {
    /// Data URL of the (re-)encoded reference image.
    pub image_url: String,
    /// Character id → slot, in input order.
    pub slots: Vec<(String, Slot)>,
}

/// Slot per input index: first is left, last is right, everything in
/// between is middle. A solo character is middle.
pub fn assign_slots(n: usize) -> Vec<Slot> {
    (0..n)
        .map(|i| {
            if n == 1 {
                Slot::Middle
            } else if i == 0 {
                Slot::Left
            } else if i == n - 1 {
                Slot::Right
            } else {
                Slot::Middle
            }
        })
        .collect()
}

/// Stitch decoded avatars onto one canvas. Pure; no I/O.
///
/// Horizontal: width = Σ widths + spacing×(n−1), height = max height,
/// images centered on the cross axis. Vertical is the transpose.
pub fn composite_canvas(
    images: &[DynamicImage],
    direction: Direction,
    spacing: u32,
    background: [u8; 4],
) -> RgbaImage {
    let n = images.len() as u32;
    let gap_total = spacing * n.saturating_sub(1);

    let (width, height) = match direction {
        Direction::Horizontal => (
            images.iter().map(|i| i.width()).sum::<u32>() + gap_total,
            images.iter().map(|i| i.height()).max().unwrap_or(0),
        ),
        Direction::Vertical => (
            images.iter().map(|i| i.width()).max().unwrap_or(0),
            images.iter().map(|i| i.height()).sum::<u32>() + gap_total,
        ),
    };

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba(background));

    let mut cursor: u32 = 0;
    for img in images {
        let rgba = img.to_rgba8();
        let (x, y) = match direction {
            Direction::Horizontal => (cursor, (height - img.height()) / 2),
            Direction::Vertical => ((width - img.width()) / 2, cursor),
        };
        imageops::overlay(&mut canvas, &rgba, x as i64, y as i64);
        cursor += match direction {
            Direction::Horizontal => img.width() + spacing,
            Direction::Vertical => img.height() + spacing,
        };
    }

    canvas
}

/// Fetch an avatar image as raw bytes. Accepts `data:` URLs and
/// http(s) URLs; anything else (or any fetch error) is a compositing
/// failure, since a missing avatar must abort the whole composite.
pub async fn fetch_avatar(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    if url.starts_with("data:") {
        return decode_base64_image(url)
            .map_err(|e| PipelineError::Compositing(format!("avatar decode: {e}")));
    }

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| PipelineError::Compositing(format!("avatar download: {e}")))?;

    if !resp.status().is_success() {
        return Err(PipelineError::Compositing(format!(
            "avatar download: HTTP {}",
            resp.status()
        )));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| PipelineError::Compositing(format!("avatar body: {e}")))?;
    Ok(bytes.to_vec())
}

/// Combine character avatars into a single reference image.
///
/// Zero characters → `None`. One character → its avatar passed through
/// untouched (no decode/re-encode cost), slot `middle`. Two or more →
/// download, stitch, re-encode as a PNG data URL.
pub async fn composite(
    client: &reqwest::Client,
    characters: &[Character],
    direction: Direction,
    settings: &Settings,
) -> Result<Option<CompositeReference>> {
    if characters.is_empty() {
        return Ok(None);
    }

    let slots: Vec<(String, Slot)> = characters
        .iter()
        .map(|c| c.id.clone())
        .zip(assign_slots(characters.len()))
        .collect();

    if characters.len() == 1 {
        return Ok(Some(CompositeReference {
            image_url: characters[0].avatar_url.clone(),
            slots,
        }));
    }

    let mut images = Vec::with_capacity(characters.len());
    for character in characters {
        let bytes = fetch_avatar(client, &character.avatar_url).await?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| PipelineError::Compositing(format!("avatar decode ({}): {e}", character.name)))?;
        images.push(img);
    }

    let canvas = composite_canvas(
        &images,
        direction,
        settings.composite_spacing,
        settings.composite_background,
    );
    debug!(
        width = canvas.width(),
        height = canvas.height(),
        characters = characters.len(),
        "composited reference canvas"
    );

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas).write_to(&mut buf, image::ImageFormat::Png)?;

    Ok(Some(CompositeReference {
        image_url: encode_data_url(buf.get_ref(), "image/png"),
        slots,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(px)))
    }

    fn character(id: &str, name: &str, avatar_url: &str) -> Character {
        Character {
            id: id.into(),
            user_id: "u1".into(),
            name: name.into(),
            avatar_url: avatar_url.into(),
            created_at: String::new(),
        }
    }

    fn png_data_url(img: &DynamicImage) -> String {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        encode_data_url(buf.get_ref(), "image/png")
    }

    #[test]
    fn slot_assignment_by_index() {
        assert_eq!(assign_slots(1), vec![Slot::Middle]);
        assert_eq!(assign_slots(2), vec![Slot::Left, Slot::Right]);
        assert_eq!(assign_slots(3), vec![Slot::Left, Slot::Middle, Slot::Right]);
        assert_eq!(
            assign_slots(4),
            vec![Slot::Left, Slot::Middle, Slot::Middle, Slot::Right]
        );
    }

    #[test]
    fn horizontal_canvas_dimensions() {
        let images = vec![
            solid(40, 60, [255, 0, 0, 255]),
            solid(30, 80, [0, 255, 0, 255]),
            solid(50, 70, [0, 0, 255, 255]),
        ];
        let canvas = composite_canvas(&images, Direction::Horizontal, 16, [255, 255, 255, 255]);
        // Σ widths + spacing × (n−1)
        assert_eq!(canvas.width(), 40 + 30 + 50 + 16 * 2);
        assert_eq!(canvas.height(), 80);
    }

    #[test]
    fn vertical_canvas_is_the_transpose() {
        let images = vec![solid(40, 60, [1, 2, 3, 255]), solid(30, 80, [4, 5, 6, 255])];
        let canvas = composite_canvas(&images, Direction::Vertical, 10, [0, 0, 0, 255]);
        assert_eq!(canvas.width(), 40);
        assert_eq!(canvas.height(), 60 + 80 + 10);
    }

    #[test]
    fn background_fills_the_gap() {
        let images = vec![solid(10, 10, [1, 1, 1, 255]), solid(10, 10, [2, 2, 2, 255])];
        let canvas = composite_canvas(&images, Direction::Horizontal, 4, [9, 9, 9, 9]);
        // Pixel inside the inter-image gap keeps the background color.
        assert_eq!(canvas.get_pixel(11, 5), &Rgba([9, 9, 9, 9]));
        assert_eq!(canvas.get_pixel(0, 0), &Rgba([1, 1, 1, 255]));
        assert_eq!(canvas.get_pixel(14, 0), &Rgba([2, 2, 2, 255]));
    }

    #[tokio::test]
    async fn zero_characters_yields_no_reference() {
        let client = reqwest::Client::new();
        let out = composite(&client, &[], Direction::Horizontal, &Settings::default())
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn solo_character_passes_avatar_through() {
        let client = reqwest::Client::new();
        let url = png_data_url(&solid(20, 20, [7, 7, 7, 255]));
        let chars = vec![character("c1", "A", &url)];
        let out = composite(&client, &chars, Direction::Horizontal, &Settings::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.image_url, url);
        assert_eq!(out.slots, vec![("c1".to_string(), Slot::Middle)]);
    }

    #[tokio::test]
    async fn two_characters_get_stitched() {
        let client = reqwest::Client::new();
        let chars = vec![
            character("c1", "A", &png_data_url(&solid(20, 30, [1, 0, 0, 255]))),
            character("c2", "B", &png_data_url(&solid(40, 10, [0, 1, 0, 255]))),
        ];
        let out = composite(&client, &chars, Direction::Horizontal, &Settings::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            out.slots,
            vec![("c1".to_string(), Slot::Left), ("c2".to_string(), Slot::Right)]
        );
        let bytes = decode_base64_image(&out.image_url).unwrap();
        let stitched = image::load_from_memory(&bytes).unwrap();
        assert_eq!(stitched.width(), 20 + 40 + 16);
        assert_eq!(stitched.height(), 30);
    }

    #[tokio::test]
    async fn broken_avatar_aborts_the_composite() {
        let client = reqwest::Client::new();
        let chars = vec![
            character("c1", "A", &png_data_url(&solid(8, 8, [0, 0, 0, 255]))),
            character("c2", "B", "data:image/png;base64,!!!not-base64!!!"),
        ];
        let err = composite(&client, &chars, Direction::Horizontal, &Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Compositing(_)));
    }
}
