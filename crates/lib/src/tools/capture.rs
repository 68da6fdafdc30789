//! Screen capture for the `computer` tool's screenshot action.
//!
//! Capturing is delegated to an external screenshot command; this module only runs it,
//! loads the PNG it writes, resizes it to the advertised display size and encodes it for the API.

use async_trait::async_trait;
use base64::Engine;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use std::process::Stdio;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::llm::{ContentBlock, ImageSource, DISPLAY_HEIGHT_PX, DISPLAY_WIDTH_PX};

const PATH_PLACEHOLDER: &str = "{path}";

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no screenshot command configured for this platform")]
    Unsupported,
    #[error("screenshot command failed: {0}")]
    Command(String),
    #[error("screenshot command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("screenshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("screenshot image: {0}")]
    Image(#[from] image::ImageError),
}

/// Produces a full-screen raster image.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<DynamicImage, CaptureError>;
}

/// An encoded image waiting to be attached to the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    pub media_type: String,
    /// Base64 (standard alphabet) of the encoded image bytes.
    pub data: String,
}

impl AttachedImage {
    pub fn to_content_block(&self) -> ContentBlock {
        ContentBlock::Image {
            source: ImageSource::base64(self.media_type.clone(), self.data.clone()),
        }
    }
}

/// Resize to the canonical 1024x768 with Lanczos3 and encode as base64 PNG.
pub fn prepare_screenshot(image: &DynamicImage) -> Result<AttachedImage, CaptureError> {
    let resized = image.resize_exact(DISPLAY_WIDTH_PX, DISPLAY_HEIGHT_PX, FilterType::Lanczos3);
    let mut png = Cursor::new(Vec::new());
    resized.write_to(&mut png, image::ImageOutputFormat::Png)?;
    Ok(AttachedImage {
        media_type: "image/png".to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(png.into_inner()),
    })
}

/// Platform screenshot command, with `{path}` standing for the output file.
pub fn default_screenshot_command() -> Option<Vec<String>> {
    let argv: &[&str] = if cfg!(target_os = "macos") {
        &["screencapture", "-x", "-t", "png", PATH_PLACEHOLDER]
    } else if cfg!(unix) {
        &["import", "-window", "root", PATH_PLACEHOLDER]
    } else {
        return None;
    };
    Some(argv.iter().map(|s| s.to_string()).collect())
}

/// Captures by running a screenshot command that writes a PNG to a temporary file.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    argv: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandCapture {
    /// Use `argv` when given, otherwise the platform default.
    pub fn new(argv: Option<Vec<String>>) -> Self {
        Self {
            argv: argv
                .filter(|a| !a.is_empty())
                .or_else(default_screenshot_command),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    /// Kill the screenshot command if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("perch-capture-{}.png", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self) -> Result<DynamicImage, CaptureError> {
        let argv = self.argv.as_ref().ok_or(CaptureError::Unsupported)?;
        let path = Self::temp_path();
        let path_str = path.to_string_lossy().into_owned();
        let args: Vec<String> = argv[1..]
            .iter()
            .map(|a| a.replace(PATH_PLACEHOLDER, &path_str))
            .collect();
        let child = Command::new(&argv[0])
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                return Err(CaptureError::TimedOut(self.timeout));
            }
        };
        if !output.status.success() {
            let _ = std::fs::remove_file(&path);
            return Err(CaptureError::Command(format!(
                "{} exited with {}: {}",
                argv[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let loaded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(&path)
        })
        .await
        .map_err(|e| CaptureError::Command(format!("loading screenshot: {}", e)))?;
        let _ = std::fs::remove_file(&path);
        Ok(loaded?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn screenshot_is_resized_to_display_size() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(200, 100, Rgba([10, 20, 30, 255])));
        let attached = prepare_screenshot(&img).unwrap();
        assert_eq!(attached.media_type, "image/png");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(attached.data.as_bytes())
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (DISPLAY_WIDTH_PX, DISPLAY_HEIGHT_PX));
    }

    #[test]
    fn attached_image_becomes_image_block() {
        let attached = AttachedImage {
            media_type: "image/png".to_string(),
            data: "AAAA".to_string(),
        };
        match attached.to_content_block() {
            ContentBlock::Image { source } => {
                assert_eq!(source.typ, "base64");
                assert_eq!(source.data, "AAAA");
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn empty_command_falls_back_to_default() {
        let c = CommandCapture::new(Some(Vec::new()));
        assert_eq!(c.argv, default_screenshot_command());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_command_times_out() {
        let c = CommandCapture::new(Some(vec!["sleep".to_string(), "5".to_string()]))
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(matches!(c.capture().await, Err(CaptureError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_an_error() {
        let c = CommandCapture::new(Some(vec!["false".to_string(), "{path}".to_string()]));
        assert!(matches!(c.capture().await, Err(CaptureError::Command(_))));
    }
}
