//! Capture requests and their normalized form
//!
//! [`normalize`] turns a user-supplied [`CaptureRequest`] into the
//! [`NormalizedOptions`] that are fingerprinted and shipped to the renderer as
//! a base64-encoded JSON payload. The same type is decoded on the renderer
//! side, so every field carries a serde default.

use crate::error::{Error, RenderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Default zoom factor
pub const DEFAULT_ZOOM: f64 = 1.0;
/// Default image quality (0.0 - 1.0)
pub const DEFAULT_QUALITY: f64 = 1.0;
/// Default delay before rendering
pub const DEFAULT_DELAY_MS: u64 = 100;
/// Default viewport width
pub const DEFAULT_WIDTH: u32 = 1024;
/// Default viewport height
pub const DEFAULT_HEIGHT: u32 = 768;

/// Output image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG screenshot
    #[default]
    Png,
    /// JPEG screenshot
    Jpeg,
    /// WebP screenshot
    Webp,
}

impl ImageFormat {
    /// Parse a user-facing format name
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    /// File extension for artifacts of this format
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }
}

/// A clip rectangle as supplied by the caller; any side may be missing
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClipRect {
    /// Distance from the top of the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<f64>,
    /// Distance from the left of the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<f64>,
    /// Region width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// Region height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// A fully specified page region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Distance from the top of the page
    pub top: f64,
    /// Distance from the left of the page
    pub left: f64,
    /// Region width
    pub width: f64,
    /// Region height
    pub height: f64,
}

impl ClipRect {
    /// Create a complete clip rectangle
    pub fn new(top: f64, left: f64, width: f64, height: f64) -> Self {
        Self {
            top: Some(top),
            left: Some(left),
            width: Some(width),
            height: Some(height),
        }
    }

    /// The region, if all four sides are present and the area is non-empty
    pub fn region(&self) -> Option<Region> {
        match (self.top, self.left, self.width, self.height) {
            (Some(top), Some(left), Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
                Some(Region {
                    top,
                    left,
                    width,
                    height,
                })
            }
            _ => None,
        }
    }
}

/// Page-level settings shared by requests and configured defaults
///
/// Every field is optional; [`normalize`] fills the gaps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageSettings {
    /// Hash fragment appended to the URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashbang: Option<String>,
    /// Viewport width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Viewport height; when set, only the viewport is captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Zoom factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    /// Delay before rendering, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Output format name (`png`, `jpeg`, `webp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Image quality, 0.0 - 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    /// Enable JavaScript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js: Option<bool>,
    /// Load images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<bool>,
    /// Basic-auth user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// User agent override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Extra HTTP headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Clip rectangle
    #[serde(default, rename = "clipRect", skip_serializing_if = "Option::is_none")]
    pub clip_rect: Option<ClipRect>,
    /// Id of the element whose bounds become the clip rectangle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elementid: Option<String>,
}

impl PageSettings {
    /// Fill every unset field from `defaults`
    pub fn or(self, defaults: &PageSettings) -> PageSettings {
        PageSettings {
            hashbang: self.hashbang.or_else(|| defaults.hashbang.clone()),
            width: self.width.or(defaults.width),
            height: self.height.or(defaults.height),
            zoom: self.zoom.or(defaults.zoom),
            delay: self.delay.or(defaults.delay),
            format: self.format.or_else(|| defaults.format.clone()),
            quality: self.quality.or(defaults.quality),
            js: self.js.or(defaults.js),
            images: self.images.or(defaults.images),
            user: self.user.or_else(|| defaults.user.clone()),
            password: self.password.or_else(|| defaults.password.clone()),
            agent: self.agent.or_else(|| defaults.agent.clone()),
            headers: self.headers.or_else(|| defaults.headers.clone()),
            clip_rect: self.clip_rect.or(defaults.clip_rect),
            elementid: self.elementid.or_else(|| defaults.elementid.clone()),
        }
    }
}

/// A user-supplied capture request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Target URL
    #[serde(default)]
    pub url: String,
    /// Page settings
    #[serde(flatten)]
    pub settings: PageSettings,
    /// Bypass the cache gate
    #[serde(default)]
    pub force: bool,
}

impl CaptureRequest {
    /// Create a request for a URL with no other settings
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the force-refresh flag
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the output format
    pub fn format<S: Into<String>>(mut self, format: S) -> Self {
        self.settings.format = Some(format.into());
        self
    }

    /// Set the element whose bounds are captured
    pub fn element<S: Into<String>>(mut self, id: S) -> Self {
        self.settings.elementid = Some(id.into());
        self
    }
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_zoom() -> f64 {
    DEFAULT_ZOOM
}

fn default_quality() -> f64 {
    DEFAULT_QUALITY
}

fn default_delay() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Canonical render options, also the renderer's wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOptions {
    /// Target URL, scheme included
    pub url: String,
    /// Hash fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashbang: Option<String>,
    /// Viewport width
    #[serde(default = "default_width")]
    pub width: u32,
    /// Viewport height
    #[serde(default = "default_height")]
    pub height: u32,
    /// Zoom factor
    #[serde(default = "default_zoom")]
    pub zoom: f64,
    /// Enable JavaScript
    #[serde(default = "default_true")]
    pub js: bool,
    /// Load images
    #[serde(default = "default_true")]
    pub images: bool,
    /// Basic-auth user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// User agent override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Extra HTTP headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Clip rectangle
    #[serde(default, rename = "clipRect", skip_serializing_if = "Option::is_none")]
    pub clip_rect: Option<ClipRect>,
    /// Image quality, 0.0 - 1.0
    #[serde(default = "default_quality")]
    pub quality: f64,
    /// Output format
    #[serde(default)]
    pub format: ImageFormat,
    /// Delay before rendering, in milliseconds
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Id of the element whose bounds become the clip rectangle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elementid: Option<String>,
    /// Capture the natural content size instead of the viewport
    #[serde(default, skip_serializing_if = "is_false")]
    pub fullpage: bool,
}

impl NormalizedOptions {
    /// Encode as the base64 JSON payload handed to the renderer
    pub fn to_payload(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Decode a base64 JSON payload
    pub fn from_payload(payload: &str) -> std::result::Result<Self, RenderError> {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| RenderError::InvalidPayload(format!("base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RenderError::InvalidPayload(format!("json: {}", e)))
    }

    /// Hash fragment normalized to start with `/`
    pub fn fragment(&self) -> Option<String> {
        let hashbang = self.hashbang.as_deref()?.trim();
        if hashbang.is_empty() {
            return None;
        }
        if hashbang.starts_with('/') {
            Some(hashbang.to_string())
        } else {
            Some(format!("/{}", hashbang))
        }
    }

    /// URL the renderer navigates to
    pub fn target_url(&self) -> String {
        match self.fragment() {
            Some(fragment) => format!("{}#{}", self.url, fragment),
            None => self.url.clone(),
        }
    }

    /// The clip region to apply before navigation, if fully specified
    pub fn initial_clip(&self) -> Option<Region> {
        self.clip_rect.as_ref().and_then(ClipRect::region)
    }

    /// CDP quality (0-100), only for formats that honour it
    pub fn cdp_quality(&self) -> Option<i64> {
        match self.format {
            ImageFormat::Png => None,
            ImageFormat::Jpeg | ImageFormat::Webp => {
                Some((self.quality.clamp(0.0, 1.0) * 100.0).round() as i64)
            }
        }
    }
}

/// Ensure the URL is non-empty, has a scheme, and parses
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::malformed("URL cannot be empty"));
    }

    let candidate = if trimmed.contains("://")
        || trimmed.starts_with("about:")
        || trimmed.starts_with("data:")
    {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed.trim_start_matches('/'))
    };

    let parsed = url::Url::parse(&candidate)
        .map_err(|e| Error::malformed(format!("Invalid URL {}: {}", raw, e)))?;
    if parsed.cannot_be_a_base() && parsed.scheme() != "about" && parsed.scheme() != "data" {
        return Err(Error::malformed(format!("Invalid URL: {}", raw)));
    }

    Ok(candidate)
}

/// Merge a request with configured defaults and engine defaults
///
/// Only a missing or malformed URL is an error; everything else degrades to a
/// default.
pub fn normalize(request: &CaptureRequest, defaults: &PageSettings) -> Result<NormalizedOptions> {
    let url = normalize_url(&request.url)?;
    let settings = request.settings.clone().or(defaults);

    let format = match settings.format.as_deref() {
        None => ImageFormat::default(),
        Some(name) => ImageFormat::parse(name).unwrap_or_else(|| {
            warn!("Unknown format {:?}, falling back to png", name);
            ImageFormat::Png
        }),
    };

    let zoom = match settings.zoom {
        Some(zoom) if zoom.is_finite() && zoom > 0.0 => zoom,
        Some(zoom) => {
            warn!("Ignoring zoom {}, using {}", zoom, DEFAULT_ZOOM);
            DEFAULT_ZOOM
        }
        None => DEFAULT_ZOOM,
    };

    let quality = match settings.quality {
        Some(quality) if quality.is_finite() => quality.clamp(0.0, 1.0),
        Some(_) => DEFAULT_QUALITY,
        None => DEFAULT_QUALITY,
    };

    let fullpage = settings.height.filter(|h| *h > 0).is_none();

    Ok(NormalizedOptions {
        url,
        hashbang: settings.hashbang.filter(|h| !h.trim().is_empty()),
        width: settings.width.filter(|w| *w > 0).unwrap_or(DEFAULT_WIDTH),
        height: settings.height.filter(|h| *h > 0).unwrap_or(DEFAULT_HEIGHT),
        zoom,
        js: settings.js.unwrap_or(true),
        images: settings.images.unwrap_or(true),
        user: settings.user,
        password: settings.password,
        agent: settings.agent,
        headers: settings.headers.unwrap_or_default(),
        clip_rect: settings.clip_rect,
        quality,
        format,
        delay: settings.delay.unwrap_or(DEFAULT_DELAY_MS),
        elementid: settings.elementid.filter(|id| !id.trim().is_empty()),
        fullpage,
    })
}
