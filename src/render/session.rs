//! Browser lifecycle for a single render
//!
//! A session owns one headless browser and one page. It lives exactly as long
//! as the renderer process and is always closed, including on failure paths.

use crate::capture::options::NormalizedOptions;
use crate::error::RenderError;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Environment variable naming the Chrome/Chromium executable
pub const CHROME_ENV_VAR: &str = "SHOTCACHE_CHROME";

/// Environment variable that disables the Chrome sandbox when set to `1`
pub const NO_SANDBOX_ENV_VAR: &str = "SHOTCACHE_NO_SANDBOX";

/// A launched browser with one blank page
pub struct RenderSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Option<Page>,
    listeners: Vec<JoinHandle<()>>,
}

impl RenderSession {
    /// Launch a headless browser sized for `options` and open a blank page
    #[instrument(skip(options), fields(width = options.width, height = options.height))]
    pub async fn launch(options: &NormalizedOptions) -> Result<Self, RenderError> {
        let mut builder = CdpBrowserConfig::builder()
            .viewport(Viewport {
                width: options.width,
                height: options.height,
                device_scale_factor: Some(options.zoom),
                emulating_mobile: false,
                is_landscape: false,
                has_touch: false,
            })
            .arg("--hide-scrollbars");

        if let Ok(path) = std::env::var(CHROME_ENV_VAR) {
            if !path.is_empty() {
                builder = builder.chrome_executable(path);
            }
        }

        if std::env::var(NO_SANDBOX_ENV_VAR).as_deref() == Ok("1") {
            builder = builder.no_sandbox();
        }

        // Every request pauses until `filter_images` lets it through
        if !options.images {
            builder = builder.enable_request_intercept();
        }

        let cdp_config = builder.build().map_err(RenderError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| RenderError::LaunchFailed(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    warn!("Browser handler event error");
                    break;
                }
            }
            debug!("Browser handler finished");
        });

        let mut session = Self {
            browser,
            handler: handler_task,
            page: None,
            listeners: Vec::new(),
        };

        let page = match session.browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                session.close().await;
                return Err(RenderError::LaunchFailed(format!(
                    "failed to create page: {}",
                    e
                )));
            }
        };
        session.listeners = forward_page_events(&page).await;
        if !options.images {
            match filter_images(&page).await {
                Ok(task) => session.listeners.push(task),
                Err(e) => {
                    session.page = Some(page);
                    session.close().await;
                    return Err(e);
                }
            }
        }
        session.page = Some(page);

        info!("Browser launched");
        Ok(session)
    }

    /// The page being rendered
    pub fn page(&self) -> Result<&Page, RenderError> {
        self.page
            .as_ref()
            .ok_or_else(|| RenderError::ConfigureFailed("page already closed".to_string()))
    }

    /// Close the page, then the browser
    #[instrument(skip(self))]
    pub async fn close(mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }

        if let Err(e) = self.browser.close().await {
            debug!("Failed to close browser: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Failed to wait for browser: {}", e);
        }

        let _ = tokio::time::timeout(Duration::from_secs(5), self.handler).await;
        debug!("Browser closed");
    }
}

/// Whether a paused request is refused while images are disabled
pub fn blocks_resource(resource_type: &ResourceType) -> bool {
    matches!(resource_type, ResourceType::Image)
}

/// Answer paused requests: images fail, everything else continues
async fn filter_images(page: &Page) -> Result<JoinHandle<()>, RenderError> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| RenderError::ConfigureFailed(format!("request interception: {}", e)))?;
    let page = page.clone();

    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let result = if blocks_resource(&event.resource_type) {
                debug!("Blocking image {}", event.request.url);
                page.execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::BlockedByClient,
                ))
                .await
                .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                    .map(|_| ())
            };
            if let Err(e) = result {
                debug!("Failed to answer paused request {}: {}", event.request.url, e);
            }
        }
    }))
}

/// Mirror in-page errors and console output into the log
async fn forward_page_events(page: &Page) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    match page.event_listener::<EventExceptionThrown>().await {
        Ok(mut events) => tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let details = &event.exception_details;
                warn!(
                    "Page error: {} ({}:{})",
                    details.text,
                    details.url.as_deref().unwrap_or("<inline>"),
                    details.line_number
                );
            }
        })),
        Err(e) => debug!("Page error listener unavailable: {}", e),
    }

    match page.event_listener::<EventConsoleApiCalled>().await {
        Ok(mut events) => tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let text = event
                    .args
                    .iter()
                    .map(|arg| {
                        arg.value
                            .as_ref()
                            .map(|v| v.to_string())
                            .or_else(|| arg.description.clone())
                            .unwrap_or_default()
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("CONSOLE: {}", text);
            }
        })),
        Err(e) => debug!("Console listener unavailable: {}", e),
    }

    tasks
}
