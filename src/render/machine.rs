//! The render state machine
//!
//! ```text
//! Parse ─▶ Configure ─▶ Open ─▶ StyleInject ─▶ Delay ─▶ ResolveRegion ─▶ Render ─▶ Exit
//!   │          │          │          │                        │             │
//!   └──────────┴──────────┴──────────┴──────── Fail ──────────┴─────────────┘
//! ```
//!
//! The orchestrator only sees the process exit code and whether the output
//! file exists.

use crate::capture::options::{ImageFormat, NormalizedOptions, Region};
use crate::error::RenderError;
use crate::render::page_ops::{element_rect, inject_default_styles};
use crate::render::session::RenderSession;
use chromiumoxide::auth::Credentials;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetScriptExecutionDisabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::{Map, Value};
use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Protocol spoken by this renderer
pub const RENDER_PROTOCOL: &str = "screenshot/1";

/// States of the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    /// Decode the options payload
    Parse,
    /// Launch the browser and configure the page
    Configure,
    /// Navigate to the target
    Open,
    /// Insert the default stylesheet
    StyleInject,
    /// Wait for asynchronous content
    Delay,
    /// Resolve the element clip region
    ResolveRegion,
    /// Write the screenshot
    Render,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderStage::Parse => "parse",
            RenderStage::Configure => "configure",
            RenderStage::Open => "open",
            RenderStage::StyleInject => "style-inject",
            RenderStage::Delay => "delay",
            RenderStage::ResolveRegion => "resolve-region",
            RenderStage::Render => "render",
        };
        f.write_str(name)
    }
}

/// A failure tagged with the stage it happened in
#[derive(Debug)]
pub struct StageError {
    /// Stage that failed
    pub stage: RenderStage,
    /// Underlying error
    pub error: RenderError,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageError {}

/// Process exit status of the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderExit {
    /// Screenshot written
    Success,
    /// Payload or protocol could not be parsed; no page was created
    InvalidInput,
    /// Something failed after parsing
    Failed,
}

impl RenderExit {
    /// Exit code handed to the operating system
    pub fn code(&self) -> i32 {
        match self {
            RenderExit::Success => 0,
            RenderExit::Failed => 1,
            RenderExit::InvalidInput => 2,
        }
    }
}

/// How the screenshot is taken, derived from the options and resolved clip
#[derive(Debug, Clone, PartialEq)]
pub struct ShotPlan {
    /// Output format
    pub format: ImageFormat,
    /// CDP quality, absent for PNG
    pub quality: Option<i64>,
    /// Region to clip to
    pub clip: Option<Region>,
    /// Capture the natural content size instead of the viewport
    pub full_page: bool,
}

impl ShotPlan {
    /// Plan a screenshot for `options` with the resolved clip
    pub fn new(options: &NormalizedOptions, clip: Option<Region>) -> Self {
        Self {
            format: options.format,
            quality: options.cdp_quality(),
            clip,
            full_page: options.fullpage && clip.is_none(),
        }
    }

    /// Convert into chromiumoxide screenshot parameters
    pub fn params(&self) -> ScreenshotParams {
        let format = match self.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            ImageFormat::Webp => CaptureScreenshotFormat::Webp,
        };

        let mut builder = ScreenshotParams::builder()
            .format(format)
            .from_surface(true)
            .full_page(self.full_page);

        if let Some(quality) = self.quality {
            builder = builder.quality(quality);
        }

        if let Some(region) = self.clip {
            builder = builder
                .clip(Viewport {
                    x: region.left,
                    y: region.top,
                    width: region.width,
                    height: region.height,
                    scale: 1.0,
                })
                .capture_beyond_viewport(true);
        }

        builder.build()
    }
}

/// Decode the protocol argument and payload
pub fn parse(script: Option<&str>, payload: &str) -> Result<NormalizedOptions, RenderError> {
    if let Some(script) = script {
        if script != RENDER_PROTOCOL {
            return Err(RenderError::UnsupportedProtocol(script.to_string()));
        }
    }
    let options = NormalizedOptions::from_payload(payload)?;
    if options.url.trim().is_empty() {
        return Err(RenderError::InvalidPayload("url is empty".to_string()));
    }
    Ok(options)
}

/// Pick the clip region after element lookup
///
/// A found element replaces the current clip; a missing one leaves it as is.
pub fn resolve_clip(current: Option<Region>, element: Option<Region>) -> Option<Region> {
    match element {
        Some(rect) if rect.width > 0.0 && rect.height > 0.0 => Some(rect),
        _ => current,
    }
}

/// Extra headers sent with every request of the page
pub fn request_headers(options: &NormalizedOptions) -> Map<String, Value> {
    options
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Credentials offered when the server answers with an auth challenge
///
/// They are never attached to requests up front, so other origins the page
/// loads from do not see them.
pub fn challenge_credentials(options: &NormalizedOptions) -> Option<Credentials> {
    options.user.as_ref().map(|user| Credentials {
        username: user.clone(),
        password: options.password.clone().unwrap_or_default(),
    })
}

/// Run the whole machine and map the result to an exit status
#[instrument(skip(payload))]
pub async fn run(script: Option<&str>, payload: &str, output: &Path) -> RenderExit {
    let options = match parse(script, payload) {
        Ok(options) => options,
        Err(error) => {
            error!(
                "Error: {}",
                StageError {
                    stage: RenderStage::Parse,
                    error
                }
            );
            return RenderExit::InvalidInput;
        }
    };
    info!("Script options: {}", serde_json::to_string(&options).unwrap_or_default());

    match render(&options, output).await {
        Ok(()) => {
            info!("Rendered screenshot: {}", output.display());
            RenderExit::Success
        }
        Err(e) => {
            error!("Error: {}", e);
            RenderExit::Failed
        }
    }
}

/// Configure through Render; the session is closed on every path
///
/// `SIGTERM` (or Ctrl-C) aborts the current stage and still closes the
/// browser, so a supervisor timeout does not leave it running.
pub async fn render(options: &NormalizedOptions, output: &Path) -> Result<(), StageError> {
    let progress = Cell::new(RenderStage::Configure);
    let shutdown = terminated();
    tokio::pin!(shutdown);

    let session = tokio::select! {
        launched = RenderSession::launch(options) => launched.map_err(|error| StageError {
            stage: RenderStage::Configure,
            error,
        })?,
        signal = &mut shutdown => {
            return Err(StageError {
                stage: RenderStage::Configure,
                error: RenderError::Terminated(signal),
            });
        }
    };

    let result = tokio::select! {
        result = drive(&session, options, output, &progress) => result,
        signal = &mut shutdown => Err(StageError {
            stage: progress.get(),
            error: RenderError::Terminated(signal),
        }),
    };
    session.close().await;
    result
}

/// Resolves with the signal name once the process is asked to stop
#[cfg(unix)]
async fn terminated() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = term.recv() => "SIGTERM",
            name = interrupted() => name,
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            interrupted().await
        }
    }
}

#[cfg(not(unix))]
async fn terminated() -> &'static str {
    interrupted().await
}

async fn interrupted() -> &'static str {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

async fn drive(
    session: &RenderSession,
    options: &NormalizedOptions,
    output: &Path,
    progress: &Cell<RenderStage>,
) -> Result<(), StageError> {
    let at = |stage: RenderStage| move |error: RenderError| StageError { stage, error };
    let enter = |stage: RenderStage| {
        debug!("Entering stage {}", stage);
        progress.set(stage);
    };

    let page = session.page().map_err(at(RenderStage::Configure))?;
    configure(page, options)
        .await
        .map_err(at(RenderStage::Configure))?;
    let clip = options.initial_clip();

    enter(RenderStage::Open);
    let url = options.target_url();
    info!("URL: {}", url);
    page.goto(url.as_str())
        .await
        .map_err(|e| RenderError::OpenFailed {
            url: url.clone(),
            message: e.to_string(),
        })
        .map_err(at(RenderStage::Open))?;

    enter(RenderStage::StyleInject);
    inject_default_styles(page)
        .await
        .map_err(at(RenderStage::StyleInject))?;

    enter(RenderStage::Delay);
    info!("Waiting for: {}", options.delay);
    tokio::time::sleep(Duration::from_millis(options.delay)).await;

    enter(RenderStage::ResolveRegion);
    let clip = match &options.elementid {
        Some(id) => {
            let rect = element_rect(page, id)
                .await
                .map_err(at(RenderStage::ResolveRegion))?;
            if rect.is_none() {
                debug!("Element #{} not found, keeping clip {:?}", id, clip);
            }
            resolve_clip(clip, rect)
        }
        None => clip,
    };

    enter(RenderStage::Render);
    let plan = ShotPlan::new(options, clip);
    debug!("Screenshot plan: {:?}", plan);
    page.save_screenshot(plan.params(), output)
        .await
        .map_err(|e| RenderError::ScreenshotFailed(e.to_string()))
        .map_err(at(RenderStage::Render))?;

    Ok(())
}

async fn configure(page: &Page, options: &NormalizedOptions) -> Result<(), RenderError> {
    let failed = |e: chromiumoxide::error::CdpError| RenderError::ConfigureFailed(e.to_string());

    if !options.js {
        page.execute(SetScriptExecutionDisabledParams::new(true))
            .await
            .map_err(failed)?;
    }

    if let Some(agent) = &options.agent {
        page.execute(SetUserAgentOverrideParams::new(agent.clone()))
            .await
            .map_err(failed)?;
    }

    let headers = request_headers(options);
    if !headers.is_empty() {
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(Value::Object(
            headers,
        ))))
        .await
        .map_err(failed)?;
    }

    if let Some(credentials) = challenge_credentials(options) {
        debug!("Answering auth challenges as {}", credentials.username);
        page.authenticate(credentials).await.map_err(failed)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::options::{normalize, CaptureRequest, ClipRect, PageSettings};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn options(request: CaptureRequest) -> NormalizedOptions {
        normalize(&request, &PageSettings::default()).unwrap()
    }

    fn region(top: f64, left: f64, width: f64, height: f64) -> Region {
        Region {
            top,
            left,
            width,
            height,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RenderExit::Success.code(), 0);
        assert_eq!(RenderExit::Failed.code(), 1);
        assert_eq!(RenderExit::InvalidInput.code(), 2);
    }

    #[test]
    fn test_parse_round_trip_payload() {
        let opts = options(CaptureRequest::new("http://example.com"));
        let payload = opts.to_payload().unwrap();
        assert_eq!(parse(Some(RENDER_PROTOCOL), &payload).unwrap(), opts);
        assert_eq!(parse(None, &payload).unwrap(), opts);
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        let payload = options(CaptureRequest::new("example.com")).to_payload().unwrap();
        assert!(matches!(
            parse(Some("scripts/screenshot.js"), &payload),
            Err(RenderError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_url() {
        let payload = BASE64.encode(r#"{"url":""}"#);
        assert!(matches!(
            parse(None, &payload),
            Err(RenderError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_run_invalid_payload_exits_without_browser() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.png");
        let exit = run(Some(RENDER_PROTOCOL), "%%%", &output).await;
        assert_eq!(exit, RenderExit::InvalidInput);
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_element_keeps_existing_clip() {
        let initial = Some(region(0.0, 0.0, 200.0, 100.0));
        assert_eq!(resolve_clip(initial, None), initial);
        assert_eq!(resolve_clip(None, None), None);
    }

    #[test]
    fn test_found_element_overrides_clip() {
        let initial = Some(region(0.0, 0.0, 200.0, 100.0));
        let banner = region(40.0, 10.0, 800.0, 120.0);
        assert_eq!(resolve_clip(initial, Some(banner)), Some(banner));
        assert_eq!(resolve_clip(None, Some(banner)), Some(banner));
    }

    #[test]
    fn test_zero_sized_element_ignored() {
        let initial = Some(region(0.0, 0.0, 200.0, 100.0));
        assert_eq!(
            resolve_clip(initial, Some(region(5.0, 5.0, 0.0, 0.0))),
            initial
        );
    }

    #[test]
    fn test_plan_png_ignores_quality() {
        let mut request = CaptureRequest::new("example.com");
        request.settings.quality = Some(0.3);
        let plan = ShotPlan::new(&options(request), None);
        assert_eq!(plan.format, ImageFormat::Png);
        assert_eq!(plan.quality, None);
        assert!(plan.full_page);
    }

    #[test]
    fn test_plan_jpeg_quality_and_viewport() {
        let mut request = CaptureRequest::new("example.com").format("jpeg");
        request.settings.quality = Some(0.75);
        request.settings.height = Some(600);
        let plan = ShotPlan::new(&options(request), None);
        assert_eq!(plan.quality, Some(75));
        assert!(!plan.full_page);
    }

    #[test]
    fn test_plan_with_initial_clip() {
        let mut request = CaptureRequest::new("example.com");
        request.settings.clip_rect = Some(ClipRect::new(10.0, 20.0, 300.0, 200.0));
        let opts = options(request);
        let plan = ShotPlan::new(&opts, opts.initial_clip());
        assert_eq!(plan.clip, Some(region(10.0, 20.0, 300.0, 200.0)));
        assert!(!plan.full_page);
    }

    #[test]
    fn test_credentials_never_become_headers() {
        let mut request = CaptureRequest::new("example.com");
        request.settings.user = Some("alice".to_string());
        request.settings.password = Some("secret".to_string());
        request.settings.headers = Some(
            [("X-Trace".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );
        let opts = options(request);

        let headers = request_headers(&opts);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["X-Trace"], "1");
        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")));

        let credentials = challenge_credentials(&opts).unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn test_user_without_password() {
        let mut request = CaptureRequest::new("example.com");
        request.settings.user = Some("alice".to_string());
        let credentials = challenge_credentials(&options(request)).unwrap();
        assert_eq!(credentials.password, "");
        assert!(challenge_credentials(&options(CaptureRequest::new("example.com"))).is_none());
    }

    #[test]
    fn test_request_headers_empty_by_default() {
        assert!(request_headers(&options(CaptureRequest::new("example.com"))).is_empty());
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError {
            stage: RenderStage::Open,
            error: RenderError::OpenFailed {
                url: "http://example.com".to_string(),
                message: "timeout".to_string(),
            },
        };
        assert!(err.to_string().starts_with("open failed:"));
    }
}
