//! Template rendering and rasterization.
//!
//! The pipeline talks to a [`Renderer`]: templates become HTML, HTML
//! becomes image bytes. The built-in [`TemplateRenderer`] loads trusted
//! local template files, fills `{{…}}` slots, and embeds the full render
//! context as a JSON data island; its rasterizer paints a deterministic
//! calendar grid from that island rather than laying out HTML. A
//! browser-backed renderer would implement the same trait and slot in at
//! composition time.

pub mod raster;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Config, ImageType};
use crate::errors::GenerateError;
use crate::fetch::CalendarEvent;

/// Identifier of the embedded context block inside rendered HTML.
pub const DATA_ISLAND_ID: &str = "calimg-data";

/// Everything a template can see.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderContext {
    /// The config id being rendered.
    pub id: String,
    /// Expanded calendar events, ascending by start.
    pub events: Vec<CalendarEvent>,
    /// The full config.
    pub config: Config,
    /// Auxiliary JSON, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Value>,
    /// The pinned "now" for this render.
    pub now: DateTime<Utc>,
    /// Locale tag for date/time formatting.
    pub locale: String,
    /// Effective timezone name (UTC when the config has none).
    pub timezone: String,
}

/// Output raster options, straight from the config.
#[derive(Debug, Clone, Copy)]
pub struct RasterOptions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Output codec.
    pub image_type: ImageType,
    /// Convert to grayscale before encoding.
    pub grayscale: bool,
    /// Bits per channel after quantization.
    pub bit_depth: u8,
    /// Clockwise rotation in degrees (0/90/180/270).
    pub rotate: u16,
}

impl RasterOptions {
    /// Derive options from a config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.width,
            height: config.height,
            image_type: config.image_type,
            grayscale: config.grayscale,
            bit_depth: config.bit_depth,
            rotate: config.rotate,
        }
    }
}

/// Encoded image bytes plus their MIME type.
#[derive(Debug, Clone)]
pub struct Raster {
    /// The encoded image.
    pub bytes: Vec<u8>,
    /// MIME type matching the codec.
    pub content_type: String,
}

/// Turns configs and events into image bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render the template into an HTML document.
    ///
    /// # Errors
    ///
    /// `TemplateFailed` when the template cannot be loaded or rendered.
    async fn render_template(
        &self,
        template: &str,
        context: &RenderContext,
    ) -> Result<String, GenerateError>;

    /// Rasterize rendered HTML into encoded image bytes.
    ///
    /// # Errors
    ///
    /// `RasterFailed` when painting or encoding fails.
    async fn rasterize(&self, html: &str, options: &RasterOptions) -> Result<Raster, GenerateError>;
}

/// The built-in renderer over local template files.
#[derive(Debug)]
pub struct TemplateRenderer {
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    /// Create a renderer reading templates from `templates_dir`.
    #[must_use]
    pub fn new(templates_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            templates_dir: templates_dir.into(),
        })
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render_template(
        &self,
        template: &str,
        context: &RenderContext,
    ) -> Result<String, GenerateError> {
        let path = self.templates_dir.join(format!("{template}.html"));
        let body = tokio::fs::read_to_string(&path).await.map_err(|e| {
            GenerateError::TemplateFailed {
                template: template.to_owned(),
                source: anyhow::anyhow!("failed to read {}: {e}", path.display()),
            }
        })?;

        let context_json =
            serde_json::to_string(context).map_err(|e| GenerateError::TemplateFailed {
                template: template.to_owned(),
                source: e.into(),
            })?;
        let context_json = escape_for_script(&context_json);

        let html = body
            .replace("{{id}}", &context.id)
            .replace("{{locale}}", &context.locale)
            .replace("{{timezone}}", &context.timezone)
            .replace("{{now}}", &context.now.to_rfc3339())
            .replace("{{eventCount}}", &context.events.len().to_string());

        let island = format!(
            "<script type=\"application/json\" id=\"{DATA_ISLAND_ID}\">{context_json}</script>"
        );
        let html = if let Some(idx) = html.rfind("</body>") {
            let (head, tail) = html.split_at(idx);
            format!("{head}{island}{tail}")
        } else {
            format!("{html}\n{island}")
        };

        Ok(html)
    }

    async fn rasterize(&self, html: &str, options: &RasterOptions) -> Result<Raster, GenerateError> {
        let context = extract_data_island(html).ok_or_else(|| GenerateError::RasterFailed {
            source: anyhow::anyhow!("rendered HTML carries no {DATA_ISLAND_ID} island"),
        })?;
        raster::paint_and_encode(&context, options)
    }
}

/// Make serialized JSON safe to embed in a `<script>` block.
///
/// Event text is untrusted: a summary containing `</script>` must not be
/// able to close the island early. `<`, `>`, and `&` only occur inside
/// JSON string literals, so swapping them for `\uXXXX` escapes keeps the
/// payload valid JSON that parses back to the identical strings.
fn escape_for_script(json: &str) -> String {
    json.replace('&', "\\u0026")
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

/// Pull the JSON context back out of rendered HTML. The island is
/// written with [`escape_for_script`], so the first `</script>` after
/// the marker is always the island's own closing tag, and the JSON
/// parser undoes the `\uXXXX` escapes.
fn extract_data_island(html: &str) -> Option<serde_json::Value> {
    let marker = format!("id=\"{DATA_ISLAND_ID}\">");
    let start = html.find(&marker)? + marker.len();
    let end = html[start..].find("</script>")? + start;
    serde_json::from_str(&html[start..end]).ok()
}
