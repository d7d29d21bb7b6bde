use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;

use crate::database::ComicFormat;

/// Strip an optional `data:image/...;base64,` prefix and decode.
pub fn decode_base64_image(s: &str) -> Result<Vec<u8>> {
    let data = if let Some(idx) = s.find(',') {
        &s[(idx + 1)..]
    } else {
        s
    };
    B64.decode(data).map_err(|e| anyhow!("base64 decode: {e}"))
}

pub fn encode_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, B64.encode(bytes))
}

pub fn guess_image_extension(bytes: &[u8]) -> &'static str {
    // PNG
    if bytes.len() >= 8 && bytes[0..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return "png";
    }
    // JPEG
    if bytes.len() >= 3 && bytes[0..3] == [0xFF, 0xD8, 0xFF] {
        return "jpg";
    }
    // WEBP (RIFF....WEBP)
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "webp";
    }
    "png"
}

/// Relative path for a rendered scene image:
/// `users/{user_id}/{comics|posters}/{scene_id}.{ext}`, with a
/// `_retry_{timestamp}` qualifier when `retry` is set.
pub fn scene_image_path(
    user_id: &str,
    format: ComicFormat,
    scene_id: &str,
    retry: bool,
    ext: &str,
) -> PathBuf {
    let name = if retry {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        format!("{scene_id}_retry_{ts}.{ext}")
    } else {
        format!("{scene_id}.{ext}")
    };
    Path::new("users")
        .join(user_id)
        .join(format.storage_folder())
        .join(name)
}

/// Decode a base64 (or data-URL) image and write it under `data_root`.
/// Returns the stored file's absolute path as a URL-ish string.
pub async fn save_scene_image(
    data_root: &Path,
    user_id: &str,
    format: ComicFormat,
    scene_id: &str,
    retry: bool,
    base64_image: &str,
) -> Result<String> {
    let bytes = decode_base64_image(base64_image)?;
    let ext = guess_image_extension(&bytes);
    let rel = scene_image_path(user_id, format, scene_id, retry, ext);
    let full = data_root.join(&rel);

    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full, bytes).await?;
    info!(path = %full.display(), "saved generated image");
    Ok(full.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_sniffing() {
        assert_eq!(
            guess_image_extension(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            "png"
        );
        assert_eq!(guess_image_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpg");
        assert_eq!(guess_image_extension(b"RIFF0000WEBPVP8 "), "webp");
        assert_eq!(guess_image_extension(b"??"), "png");
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let url = encode_data_url(b"hello", "image/png");
        let decoded = decode_base64_image(&url).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn poster_and_comic_paths_differ() {
        let comic = scene_image_path("u1", ComicFormat::FourPanel, "s1", false, "png");
        let poster = scene_image_path("u1", ComicFormat::SinglePanel, "s1", false, "png");
        assert_eq!(comic, Path::new("users/u1/comics/s1.png"));
        assert_eq!(poster, Path::new("users/u1/posters/s1.png"));
    }

    #[test]
    fn retry_path_is_timestamp_qualified() {
        let p = scene_image_path("u1", ComicFormat::FourPanel, "s3", true, "png");
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("s3_retry_"));
        assert!(name.ends_with(".png"));
    }

    #[tokio::test]
    async fn save_writes_decoded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let b64 = B64.encode(b"fake-png");
        let path = save_scene_image(dir.path(), "u1", ComicFormat::FourPanel, "s1", false, &b64)
            .await
            .unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, b"fake-png");
    }
}
