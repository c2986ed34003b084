//! Config files: schema, defaults, validation, loading, and watching.
//!
//! One JSON file per config lives in the config directory; the file stem
//! is the config id. Unknown top-level keys are rejected so typos fail
//! loudly instead of silently disabling an option.

pub mod store;
pub mod watcher;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use store::ConfigStore;
pub use watcher::{ConfigEvent, WatchOptions};

/// Output image codec. Fixes the URL extension and the content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Portable Network Graphics (default).
    #[default]
    Png,
    /// JPEG.
    Jpg,
    /// Windows bitmap.
    Bmp,
}

impl ImageType {
    /// The URL/file extension for this codec.
    #[must_use]
    pub fn ext(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Bmp => "bmp",
        }
    }

    /// The MIME type served with this codec.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Bmp => "image/bmp",
        }
    }

    /// Parse a URL extension.
    #[must_use]
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "png" => Some(Self::Png),
            "jpg" => Some(Self::Jpg),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

/// One calendar source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IcsSource {
    /// Feed URL (`http://` or `https://`).
    pub url: String,
    /// Label attached to events from this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

/// Calendar source(s): absent, a single URL, or a list of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IcsUrl {
    /// A single feed URL.
    Single(String),
    /// Multiple feeds, each optionally named.
    Multi(Vec<IcsSource>),
}

impl IcsUrl {
    /// Normalize to a list of sources.
    #[must_use]
    pub fn sources(&self) -> Vec<IcsSource> {
        match self {
            Self::Single(url) => vec![IcsSource {
                url: url.clone(),
                source_name: None,
            }],
            Self::Multi(list) => list.clone(),
        }
    }
}

/// One auxiliary JSON source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtraDataSource {
    /// Source URL.
    pub url: String,
    /// Request headers for this source; merged over `extraDataHeaders`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Cache TTL in seconds for this source; overrides `extraDataCacheTtl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
}

/// Auxiliary JSON: absent, a single URL, or a list of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraDataUrl {
    /// A single URL fetched with the default headers and TTL.
    Single(String),
    /// Multiple sources, fetched in parallel; results keep list order.
    Multi(Vec<ExtraDataSource>),
}

/// A validated per-config options file.
///
/// Deserialization applies defaults; [`Config::validate`] enforces the
/// ranges and formats that serde alone cannot express.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Calendar source(s); absent means an empty event set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ics_url: Option<IcsUrl>,

    /// Template identifier (file stem under the templates directory).
    pub template: String,

    /// Raster width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Raster height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Convert the output to grayscale.
    #[serde(default)]
    pub grayscale: bool,

    /// Bits per channel after quantization.
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u8,

    /// Clockwise rotation in degrees: 0, 90, 180, or 270.
    #[serde(default)]
    pub rotate: u16,

    /// Output codec; fixes the URL extension.
    #[serde(default)]
    pub image_type: ImageType,

    /// Start of the recurrence expansion window, in days relative to now.
    #[serde(default = "default_expand_from")]
    pub expand_recurring_from: i32,

    /// End of the recurrence expansion window, in days relative to now.
    #[serde(default = "default_expand_to")]
    pub expand_recurring_to: i32,

    /// BCP-47-like locale tag for date/time formatting.
    #[serde(default = "default_locale")]
    pub locale: String,

    /// IANA timezone for event interpretation; absent means UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Auxiliary JSON source(s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data_url: Option<ExtraDataUrl>,

    /// Default headers for auxiliary fetches.
    #[serde(default)]
    pub extra_data_headers: BTreeMap<String, String>,

    /// Default TTL in seconds for auxiliary fetches.
    #[serde(default = "default_extra_ttl")]
    pub extra_data_cache_ttl: u64,

    /// Cron expression for background pre-generation; absent disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_generate_interval: Option<String>,
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_bit_depth() -> u8 {
    8
}

fn default_expand_from() -> i32 {
    -31
}

fn default_expand_to() -> i32 {
    31
}

fn default_locale() -> String {
    "en-US".to_owned()
}

fn default_extra_ttl() -> u64 {
    300
}

impl Config {
    /// Whether this config participates in scheduled pre-generation.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.pre_generate_interval.is_some()
    }

    /// Validate everything serde's shape checks cannot: numeric ranges,
    /// URL schemes, the locale pattern, the timezone name, and the cron
    /// expression.
    ///
    /// # Errors
    ///
    /// Returns the first violation as a human-readable message.
    pub fn validate(&self) -> Result<(), String> {
        if self.template.trim().is_empty() {
            return Err("template must be a non-empty string".to_owned());
        }
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if !(100..=4096).contains(&value) {
                return Err(format!("{field} must be between 100 and 4096, got {value}"));
            }
        }
        if !(1..=32).contains(&self.bit_depth) {
            return Err(format!("bitDepth must be between 1 and 32, got {}", self.bit_depth));
        }
        if ![0, 90, 180, 270].contains(&self.rotate) {
            return Err(format!("rotate must be 0, 90, 180, or 270, got {}", self.rotate));
        }
        if !valid_locale(&self.locale) {
            return Err(format!("locale '{}' does not match ll[-CC] form", self.locale));
        }
        if let Some(tz) = &self.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(format!("timezone '{tz}' is not a known IANA zone"));
            }
        }
        if let Some(ics) = &self.ics_url {
            let sources = ics.sources();
            if sources.is_empty() {
                return Err("icsUrl array must not be empty".to_owned());
            }
            for source in &sources {
                validate_url(&source.url, "icsUrl")?;
            }
        }
        if let Some(extra) = &self.extra_data_url {
            let urls: Vec<&str> = match extra {
                ExtraDataUrl::Single(url) => vec![url.as_str()],
                ExtraDataUrl::Multi(list) => list.iter().map(|s| s.url.as_str()).collect(),
            };
            if urls.is_empty() {
                return Err("extraDataUrl array must not be empty".to_owned());
            }
            for url in urls {
                validate_url(url, "extraDataUrl")?;
            }
        }
        if let Some(cron) = &self.pre_generate_interval {
            crate::cron::validate(cron)
                .map_err(|e| format!("preGenerateInterval is not a valid cron expression: {e}"))?;
        }
        Ok(())
    }
}

fn validate_url(url: &str, field: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("{field} '{url}' must start with http:// or https://"))
    }
}

/// `^[a-z]{2,3}(-[A-Z]{2})?$` without pulling in a regex engine.
fn valid_locale(tag: &str) -> bool {
    let (lang, region) = match tag.split_once('-') {
        Some((lang, region)) => (lang, Some(region)),
        None => (tag, None),
    };
    let lang_ok = (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = region.is_none_or(|r| r.len() == 2 && r.chars().all(|c| c.is_ascii_uppercase()));
    lang_ok && region_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(template: &str) -> Config {
        serde_json::from_value(serde_json::json!({ "template": template })).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = minimal("week-view");
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 600);
        assert_eq!(config.bit_depth, 8);
        assert_eq!(config.rotate, 0);
        assert_eq!(config.image_type, ImageType::Png);
        assert_eq!(config.expand_recurring_from, -31);
        assert_eq!(config.expand_recurring_to, 31);
        assert_eq!(config.locale, "en-US");
        assert_eq!(config.extra_data_cache_ttl, 300);
        assert!(!config.grayscale);
        assert!(config.ics_url.is_none());
        assert!(!config.is_schedulable());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = serde_json::from_value(serde_json::json!({
            "template": "t",
            "widht": 300,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn ics_url_accepts_string_and_array() {
        let single: Config = serde_json::from_value(serde_json::json!({
            "template": "t",
            "icsUrl": "https://example.com/cal.ics",
        }))
        .unwrap();
        assert_eq!(single.ics_url.as_ref().unwrap().sources().len(), 1);

        let multi: Config = serde_json::from_value(serde_json::json!({
            "template": "t",
            "icsUrl": [
                { "url": "https://example.com/a.ics", "sourceName": "work" },
                { "url": "https://example.com/b.ics" },
            ],
        }))
        .unwrap();
        let sources = multi.ics_url.as_ref().unwrap().sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source_name.as_deref(), Some("work"));
    }

    #[test]
    fn validate_catches_out_of_range_dimensions() {
        let mut config = minimal("t");
        config.width = 50;
        assert!(config.validate().unwrap_err().contains("width"));

        config.width = 800;
        config.height = 5000;
        assert!(config.validate().unwrap_err().contains("height"));
    }

    #[test]
    fn validate_catches_bad_rotate_and_depth() {
        let mut config = minimal("t");
        config.rotate = 45;
        assert!(config.validate().is_err());

        config.rotate = 270;
        config.bit_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_locale_forms() {
        assert!(valid_locale("en"));
        assert!(valid_locale("en-US"));
        assert!(valid_locale("nds"));
        assert!(!valid_locale("EN-us"));
        assert!(!valid_locale("english"));
        assert!(!valid_locale("en-USA"));
    }

    #[test]
    fn validate_rejects_unknown_timezone() {
        let mut config = minimal("t");
        config.timezone = Some("Mars/Olympus_Mons".to_owned());
        assert!(config.validate().is_err());

        config.timezone = Some("Europe/Brussels".to_owned());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_cron() {
        let mut config = minimal("t");
        config.pre_generate_interval = Some("*/5 * * *".to_owned());
        assert!(config.validate().is_err());

        config.pre_generate_interval = Some("*/5 * * * *".to_owned());
        assert!(config.validate().is_ok());
        assert!(config.is_schedulable());
    }

    #[test]
    fn validate_rejects_non_http_urls() {
        let mut config = minimal("t");
        config.ics_url = Some(IcsUrl::Single("ftp://example.com/cal.ics".to_owned()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn structural_equality_detects_changes() {
        let a = minimal("t");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.width = 1024;
        assert_ne!(a, b);
    }
}
