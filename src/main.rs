//! shotcache CLI
//!
//! Capture one screenshot and print the artifact path.

use anyhow::Context;
use clap::Parser;
use shotcache::capture::{CaptureRequest, ClipRect, PageSettings};
use shotcache::{CaptureConfig, Capturer};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// shotcache - cached web page screenshots
#[derive(Parser, Debug)]
#[command(name = "shotcache")]
#[command(version)]
#[command(about = "Capture a cached screenshot of a web page")]
struct Args {
    /// URL to capture
    url: String,

    /// Output format (png, jpeg, webp)
    #[arg(short, long)]
    format: Option<String>,

    /// Viewport width
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height; captures only the viewport when set
    #[arg(long)]
    height: Option<u32>,

    /// Zoom factor
    #[arg(long)]
    zoom: Option<f64>,

    /// Delay before rendering, in milliseconds
    #[arg(long)]
    delay: Option<u64>,

    /// Image quality, 0.0 - 1.0 (ignored for png)
    #[arg(long)]
    quality: Option<f64>,

    /// Capture only the element with this id
    #[arg(short, long)]
    element: Option<String>,

    /// Hash fragment appended to the URL
    #[arg(long)]
    hashbang: Option<String>,

    /// Clip rectangle as TOP,LEFT,WIDTH,HEIGHT
    #[arg(long, value_parser = parse_clip)]
    clip: Option<ClipRect>,

    /// User agent
    #[arg(long)]
    agent: Option<String>,

    /// Basic-auth user
    #[arg(long)]
    user: Option<String>,

    /// Basic-auth password
    #[arg(long)]
    password: Option<String>,

    /// Extra header as NAME:VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Disable JavaScript
    #[arg(long)]
    no_js: bool,

    /// Do not load images
    #[arg(long)]
    no_images: bool,

    /// Ignore any cached artifact
    #[arg(long)]
    force: bool,

    /// Enable the cache
    #[arg(long)]
    cache: bool,

    /// Compress the artifact after rendering
    #[arg(long)]
    compress: bool,

    /// Storage directory
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Renderer timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {}", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_clip(raw: &str) -> Result<ClipRect, String> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [top, left, width, height] => Ok(ClipRect::new(*top, *left, *width, *height)),
        _ => Err(format!("expected TOP,LEFT,WIDTH,HEIGHT, got {}", raw)),
    }
}

impl Args {
    fn config(&self) -> anyhow::Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::from_json_file(path)?,
            None => CaptureConfig::default(),
        }
        .with_env_overrides()?;

        if let Some(storage) = &self.storage {
            config.storage = storage.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        config.cache |= self.cache;
        config.compress |= self.compress;
        Ok(config)
    }

    fn request(&self) -> CaptureRequest {
        let headers: BTreeMap<String, String> = self.headers.iter().cloned().collect();
        CaptureRequest {
            url: self.url.clone(),
            settings: PageSettings {
                hashbang: self.hashbang.clone(),
                width: self.width,
                height: self.height,
                zoom: self.zoom,
                delay: self.delay,
                format: self.format.clone(),
                quality: self.quality,
                js: self.no_js.then_some(false),
                images: self.no_images.then_some(false),
                user: self.user.clone(),
                password: self.password.clone(),
                agent: self.agent.clone(),
                headers: (!headers.is_empty()).then_some(headers),
                clip_rect: self.clip,
                elementid: self.element.clone(),
            },
            force: self.force,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config().context("Failed to load configuration")?;
    let capturer = Capturer::new(config)
        .await
        .context("Failed to prepare capture storage")?;

    let outcome = capturer.capture(&args.request()).await?;

    println!("{}", outcome.path.display());
    if let Some(error) = &outcome.error {
        tracing::error!("{}", error);
    }

    std::process::exit(outcome.status.code());
}
