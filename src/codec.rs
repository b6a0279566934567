use crate::config::LoadRetryConfig;
use crate::error::Result;
use crate::retry::{not_ready, retry_with_linear_backoff};
use image::{ExtendedColorType, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Whether the path names a TIFF, which may carry GeoTIFF georeferencing
pub fn is_tiff_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}

/// Decode `path` to RGB8.
///
/// An upload may still be flushing when the worker picks the job up, so a
/// missing or undecodable file is retried at a fixed interval before the
/// load fails with `InputNotReady`.
pub async fn load_rgb(path: &Path, retry: &LoadRetryConfig) -> Result<RgbImage> {
    let attempts = Arc::new(AtomicU32::new(0));
    let path = path.to_path_buf();

    retry_with_linear_backoff(
        || {
            let path = path.clone();
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let shown = path.display().to_string();
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(not_ready(&shown, attempt));
                }

                let decoded = tokio::task::spawn_blocking(move || image::open(&path)).await?;
                match decoded {
                    Ok(img) => Ok(img.to_rgb8()),
                    Err(e) => {
                        tracing::debug!(path = %shown, error = %e, "Input not decodable yet");
                        Err(not_ready(&shown, attempt))
                    }
                }
            }
        },
        retry.max_attempts,
        retry.delay_ms,
    )
    .await
}

/// Encode an RGB8 pixel buffer; the format follows the file extension
pub fn save_rgb(pixels: &[u8], width: u32, height: u32, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    image::save_buffer(path, pixels, width, height, ExtendedColorType::Rgb8)?;
    tracing::debug!(path = %path.display(), width = width, height = height, "Output encoded");
    Ok(())
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Output location for a job: `<output_dir>/<job_id><ext of input>`
pub fn output_path_for(output_dir: &Path, job_id: &str, input_path: &Path) -> PathBuf {
    match input_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => output_dir.join(format!("{}.{}", job_id, ext)),
        None => output_dir.join(format!("{}.png", job_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use image::Rgb;
    use tempfile::TempDir;

    #[test]
    fn test_tiff_detection() {
        assert!(is_tiff_path(Path::new("scene.TIF")));
        assert!(is_tiff_path(Path::new("a/b/scene.tiff")));
        assert!(!is_tiff_path(Path::new("photo.png")));
        assert!(!is_tiff_path(Path::new("noext")));
    }

    #[test]
    fn test_output_path_keeps_input_extension() {
        let out = output_path_for(Path::new("/out"), "job-7", Path::new("/in/job-7.jpg"));
        assert_eq!(out, PathBuf::from("/out/job-7.jpg"));
        let out = output_path_for(Path::new("/out"), "job-8", Path::new("/in/job-8"));
        assert_eq!(out, PathBuf::from("/out/job-8.png"));
    }

    #[tokio::test]
    async fn test_load_missing_file_fails_after_bounded_attempts() {
        let dir = TempDir::new().unwrap();
        let retry = LoadRetryConfig { max_attempts: 3, delay_ms: 1 };

        let err = load_rgb(&dir.path().join("never.png"), &retry).await.unwrap_err();
        match err {
            JobError::InputNotReady { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.png");
        let img = RgbImage::from_pixel(4, 3, Rgb([7, 8, 9]));

        save_rgb(img.as_raw(), 4, 3, &path).unwrap();
        let loaded = load_rgb(&path, &LoadRetryConfig::default()).await.unwrap();
        assert_eq!(loaded, img);
    }
}
