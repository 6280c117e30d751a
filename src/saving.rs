#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// Image extensions accepted for before/after photos.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// Longest side of a generated thumbnail, in pixels.
pub const THUMBNAIL_SIZE: u32 = 200;

fn extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

pub fn allowed_image(file_name: &str) -> bool {
    extension(file_name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Reduce an uploaded file name to a safe, flat name.
///
/// Only ASCII letters, digits, `.`, `-` and `_` survive; whitespace becomes
/// `_` and leading dots are stripped.
pub fn sanitize_filename(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Save an uploaded image as `<uuid>_<sanitized name>` and return the new name.
///
/// # Errors
/// * `Validation` if the extension is not an allowed image type
/// * `Io` if the directory or file cannot be written
pub fn store_upload(dir: &Path, original_name: &str, bytes: &[u8]) -> Result<String> {
    if !allowed_image(original_name) {
        return Err(AppError::validation(format!(
            "File type not allowed: {}",
            original_name
        )));
    }
    fs::create_dir_all(dir)?;
    let file_name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(original_name));
    fs::write(dir.join(&file_name), bytes)?;
    debug!(%file_name, size = bytes.len(), "upload stored");
    Ok(file_name)
}

/// Save a camera capture sent as `data:image/<ext>;base64,...`.
///
/// Returns `Ok(None)` when `data_url` is not an image data URL, so callers can
/// fall back to a regular file field.
///
/// # Errors
/// * `Validation` for an unsupported image type or invalid base64
pub fn store_data_url(dir: &Path, data_url: &str, prefix: &str) -> Result<Option<String>> {
    let Some(rest) = data_url.trim().strip_prefix("data:image/") else {
        return Ok(None);
    };
    let Some((mime, payload)) = rest.split_once(";base64,") else {
        return Ok(None);
    };
    let ext = match mime.to_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    };
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AppError::validation(format!(
            "Image type not allowed: {}",
            mime
        )));
    }
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| AppError::validation(format!("Invalid image data: {}", e)))?;

    fs::create_dir_all(dir)?;
    let file_name = format!("{}_{}.{}", prefix, Uuid::new_v4(), ext);
    fs::write(dir.join(&file_name), &bytes)?;
    debug!(%file_name, size = bytes.len(), "captured image stored");
    Ok(Some(file_name))
}

/// Write `thumb_<file_name>` next to the image, bounded by `max` pixels.
///
/// Thumbnails are optional; failures are logged and yield `None`.
pub fn make_thumbnail(dir: &Path, file_name: &str, max: u32) -> Option<String> {
    let source = dir.join(file_name);
    let thumb_name = format!("thumb_{}", file_name);
    let result = image::open(&source)
        .and_then(|img| img.thumbnail(max, max).save(dir.join(&thumb_name)));
    match result {
        Ok(()) => Some(thumb_name),
        Err(e) => {
            warn!(%file_name, error = %e, "thumbnail not generated");
            None
        }
    }
}

/// Delete stored files; missing files are ignored.
pub fn remove_files(dir: &Path, names: &[String]) {
    for name in names {
        let safe = sanitize_filename(name);
        if safe.is_empty() {
            continue;
        }
        match fs::remove_file(dir.join(&safe)) {
            Ok(()) => debug!(file_name = %safe, "file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(file_name = %safe, error = %e, "file not removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("photo.JPG", true)]
    #[case("shop.webp", true)]
    #[case("report.xlsx", false)]
    #[case("noext", false)]
    fn image_extensions(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(allowed_image(name), expected);
    }

    #[rstest]
    #[case("../../etc/passwd", "passwd")]
    #[case("C:\\Users\\me\\shop front.png", "shop_front.png")]
    #[case(".hidden.jpg", "hidden.jpg")]
    #[case("ọjà.jpg", "j.jpg")]
    fn filenames_are_sanitized(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_filename(input), expected);
    }

    #[test]
    fn uploads_get_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let name = store_upload(dir.path(), "front.png", b"png-bytes").unwrap();
        assert!(name.ends_with("_front.png"));
        assert_eq!(fs::read(dir.path().join(&name)).unwrap(), b"png-bytes");

        let err = store_upload(dir.path(), "virus.exe", b"MZ").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn data_urls_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpeg-bytes"));
        let name = store_data_url(dir.path(), &url, "before").unwrap().unwrap();
        assert!(name.starts_with("before_") && name.ends_with(".jpg"));
        assert_eq!(fs::read(dir.path().join(&name)).unwrap(), b"jpeg-bytes");

        assert_eq!(store_data_url(dir.path(), "not a data url", "after").unwrap(), None);
        assert!(store_data_url(dir.path(), "data:image/png;base64,@@@", "after").is_err());
        assert!(store_data_url(dir.path(), "data:image/svg+xml;base64,AAAA", "after").is_err());
    }

    #[test]
    fn thumbnails_fit_the_bound() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::new(400, 300)
            .save(dir.path().join("wide.png"))
            .unwrap();

        let thumb = make_thumbnail(dir.path(), "wide.png", THUMBNAIL_SIZE).unwrap();
        let (w, h) = image::image_dimensions(dir.path().join(&thumb)).unwrap();
        assert_eq!((w, h), (200, 150));

        assert_eq!(make_thumbnail(dir.path(), "missing.png", THUMBNAIL_SIZE), None);
    }

    #[test]
    fn removal_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        remove_files(dir.path(), &["a.jpg".to_string(), "gone.jpg".to_string()]);
        assert!(!dir.path().join("a.jpg").exists());
    }
}
