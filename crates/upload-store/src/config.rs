//! Upload pipeline configuration.
//!
//! Settings can be built programmatically, read from a TOML file, or
//! overridden from environment variables.

use pdf_engine::ThumbnailSize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub const ENV_PREVIEWS: &str = "PDF_UPLOADS_PREVIEWS";
pub const ENV_PREVIEW_PAGE: &str = "PDF_UPLOADS_PREVIEW_PAGE";
pub const ENV_PREVIEW_SIZE: &str = "PDF_UPLOADS_PREVIEW_SIZE";
pub const ENV_ON_PARSE_FAILURE: &str = "PDF_UPLOADS_ON_PARSE_FAILURE";

/// Largest preview width or height accepted, in pixels.
pub const MAX_PREVIEW_DIMENSION: u32 = 4096;

/// What happens to a record whose document fails to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseFailurePolicy {
    /// Keep the record and move it to the `Failed` stage.
    #[default]
    MarkFailed,
    /// Drop the record from the list.
    Remove,
}

impl FromStr for ParseFailurePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mark-failed" | "mark_failed" | "keep" => Ok(Self::MarkFailed),
            "remove" | "drop" => Ok(Self::Remove),
            _ => Err(ConfigError::InvalidValue(ENV_ON_PARSE_FAILURE.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Render a preview once a document is parsed
    pub generate_previews: bool,
    /// 1-based page used for the preview; clamped to the document
    pub preview_page: u32,
    /// Bounding box of the preview thumbnail
    pub preview_size: ThumbnailSize,
    pub on_parse_failure: ParseFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generate_previews: true,
            preview_page: 1,
            preview_size: ThumbnailSize { width_px: 160, height_px: 200 },
            on_parse_failure: ParseFailurePolicy::MarkFailed,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    generate_previews: Option<bool>,
    preview_page: Option<u32>,
    preview_width: Option<u32>,
    preview_height: Option<u32>,
    on_parse_failure: Option<ParseFailurePolicy>,
}

impl PipelineConfig {
    pub fn with_previews(mut self, enabled: bool) -> Self {
        self.generate_previews = enabled;
        self
    }

    pub fn with_preview_page(mut self, page: u32) -> Self {
        self.preview_page = page.max(1);
        self
    }

    pub fn with_preview_size(mut self, width_px: u32, height_px: u32) -> Self {
        self.preview_size = ThumbnailSize {
            width_px: width_px.clamp(1, MAX_PREVIEW_DIMENSION),
            height_px: height_px.clamp(1, MAX_PREVIEW_DIMENSION),
        };
        self
    }

    pub fn with_failure_policy(mut self, policy: ParseFailurePolicy) -> Self {
        self.on_parse_failure = policy;
        self
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `PDF_UPLOADS_PREVIEWS`: `true`/`false` (default: true)
    /// - `PDF_UPLOADS_PREVIEW_PAGE`: 1-based page (default: 1)
    /// - `PDF_UPLOADS_PREVIEW_SIZE`: `WIDTHxHEIGHT` in pixels, each at most
    ///   [`MAX_PREVIEW_DIMENSION`] (default: 160x200)
    /// - `PDF_UPLOADS_ON_PARSE_FAILURE`: `mark-failed` or `remove`
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Overrides fields from variables returned by `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PREVIEWS) {
            self.generate_previews = parse_bool(&value)
                .ok_or_else(|| ConfigError::InvalidValue(ENV_PREVIEWS.to_owned()))?;
        }

        if let Some(value) = lookup(ENV_PREVIEW_PAGE) {
            self.preview_page = value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|page| *page >= 1)
                .ok_or_else(|| ConfigError::InvalidValue(ENV_PREVIEW_PAGE.to_owned()))?;
        }

        if let Some(value) = lookup(ENV_PREVIEW_SIZE) {
            self.preview_size = parse_size(&value)
                .ok_or_else(|| ConfigError::InvalidValue(ENV_PREVIEW_SIZE.to_owned()))?;
        }

        if let Some(value) = lookup(ENV_ON_PARSE_FAILURE) {
            self.on_parse_failure = value.parse()?;
        }

        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// generate_previews = true
    /// preview_page = 1
    /// preview_width = 160
    /// preview_height = 200
    /// on_parse_failure = "mark-failed"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        let mut config = Self::default();

        if let Some(enabled) = file.generate_previews {
            config.generate_previews = enabled;
        }
        if let Some(page) = file.preview_page {
            if page == 0 {
                return Err(ConfigError::InvalidValue("preview_page".to_owned()));
            }
            config.preview_page = page;
        }
        if let Some(width) = file.preview_width {
            if !valid_dimension(width) {
                return Err(ConfigError::InvalidValue("preview_width".to_owned()));
            }
            config.preview_size.width_px = width;
        }
        if let Some(height) = file.preview_height {
            if !valid_dimension(height) {
                return Err(ConfigError::InvalidValue("preview_height".to_owned()));
            }
            config.preview_size.height_px = height;
        }
        if let Some(policy) = file.on_parse_failure {
            config.on_parse_failure = policy;
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn valid_dimension(pixels: u32) -> bool {
    (1..=MAX_PREVIEW_DIMENSION).contains(&pixels)
}

fn parse_size(value: &str) -> Option<ThumbnailSize> {
    let (width, height) = value.trim().split_once(['x', 'X'])?;
    let width_px = width.trim().parse::<u32>().ok().filter(|w| valid_dimension(*w))?;
    let height_px = height.trim().parse::<u32>().ok().filter(|h| valid_dimension(*h))?;
    Some(ThumbnailSize { width_px, height_px })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
