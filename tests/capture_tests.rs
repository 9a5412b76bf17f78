//! Capture pipeline tests
//!
//! These tests drive the real supervisor against small `/bin/sh` stand-ins
//! for the renderer. The stand-in receives `$1` = script, `$2` = payload,
//! `$3` = output path, exactly like `shotcache-render`.

#![cfg(unix)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pretty_assertions::assert_eq;
use serde_json::Value;
use shotcache::capture::{CaptureRequest, PageSettings};
use shotcache::{CaptureConfig, Capturer, Error, RenderStatus};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    storage: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        Self { dir, storage }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a stand-in renderer and return the command that runs it
    fn renderer(&self, body: &str) -> String {
        let script = self.path("render.sh");
        let work = self.dir.path().display().to_string();
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nWORK=\"{}\"\necho run >> \"$WORK/invocations\"\n{}\n",
                work, body
            ),
        )
        .unwrap();
        // Run through sh so the script never has to be executable
        format!("sh {}", script.display())
    }

    fn config(&self, command: String) -> CaptureConfig {
        CaptureConfig::builder()
            .command(command)
            .storage(&self.storage)
            .timeout_ms(10_000)
            .build()
    }

    fn invocations(&self) -> usize {
        std::fs::read_to_string(self.path("invocations"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn payload(&self) -> Value {
        let raw = std::fs::read_to_string(self.path("payload.b64")).unwrap();
        let json = BASE64.decode(raw.trim()).unwrap();
        serde_json::from_slice(&json).unwrap()
    }
}

const WRITE_ARTIFACT: &str = r#"
echo "$2" > "$WORK/payload.b64"
echo "$1" > "$WORK/script"
printf 'artifact' > "$3"
"#;

fn write_png(path: &Path) {
    let img = image::RgbaImage::from_fn(32, 32, |x, y| {
        if (x + y) % 2 == 0 {
            image::Rgba([255, 255, 255, 255])
        } else {
            image::Rgba([10, 20, 30, 255])
        }
    });
    img.save(path).unwrap();
}

#[tokio::test]
async fn test_render_with_default_payload() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config(h.renderer(WRITE_ARTIFACT)))
        .await
        .unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com").format("png"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::Success);
    assert_eq!(outcome.status.code(), 0);
    assert!(!outcome.cached);
    assert!(outcome.path.exists());
    assert!(outcome.path.starts_with(&h.storage));
    assert!(outcome
        .path
        .to_string_lossy()
        .ends_with("-printed-map.png"));
    assert_eq!(h.invocations(), 1);

    let payload = h.payload();
    assert_eq!(payload["url"], "http://example.com");
    assert_eq!(payload["width"], 1024);
    assert_eq!(payload["height"], 768);
    assert_eq!(payload["zoom"].as_f64(), Some(1.0));
    assert_eq!(payload["delay"], 100);
    assert_eq!(payload["format"], "png");
    assert_eq!(payload["js"], true);
    assert_eq!(payload["images"], true);
    assert!(payload.get("force").is_none());

    let script = std::fs::read_to_string(h.path("script")).unwrap();
    assert_eq!(script.trim(), "screenshot/1");
}

#[tokio::test]
async fn test_cache_hit_skips_renderer() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.cache = true;
    let capturer = Capturer::new(config).await.unwrap();
    let request = CaptureRequest::new("http://example.com").format("png");

    let first = capturer.capture(&request).await.unwrap();
    let second = capturer.capture(&request).await.unwrap();

    assert_eq!(h.invocations(), 1);
    assert!(second.cached);
    assert_eq!(second.status, RenderStatus::Success);
    assert_eq!(second.path, first.path);
}

#[tokio::test]
async fn test_force_flag_does_not_change_cache_identity() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.cache = true;
    let capturer = Capturer::new(config).await.unwrap();

    capturer
        .capture(&CaptureRequest::new("example.com").force(true))
        .await
        .unwrap();
    let cached = capturer
        .capture(&CaptureRequest::new("example.com"))
        .await
        .unwrap();

    assert!(cached.cached);
    assert_eq!(h.invocations(), 1);
}

#[tokio::test]
async fn test_force_always_renders() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.cache = true;
    let capturer = Capturer::new(config).await.unwrap();
    let request = CaptureRequest::new("http://example.com");

    let first = capturer.capture(&request).await.unwrap();
    let forced = capturer.capture(&request.clone().force(true)).await.unwrap();

    assert_eq!(h.invocations(), 2);
    assert!(!forced.cached);
    assert_ne!(forced.path, first.path);
    assert!(first.path.exists());
}

#[tokio::test]
async fn test_cache_disabled_always_renders() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config(h.renderer(WRITE_ARTIFACT)))
        .await
        .unwrap();
    let request = CaptureRequest::new("http://example.com");

    capturer.capture(&request).await.unwrap();
    let second = capturer.capture(&request).await.unwrap();

    assert_eq!(h.invocations(), 2);
    assert!(!second.cached);
}

#[tokio::test]
async fn test_deleted_artifact_is_regenerated() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.cache = true;
    let capturer = Capturer::new(config).await.unwrap();
    let request = CaptureRequest::new("http://example.com");

    let first = capturer.capture(&request).await.unwrap();
    std::fs::remove_file(&first.path).unwrap();
    let second = capturer.capture(&request).await.unwrap();

    assert_eq!(h.invocations(), 2);
    assert!(!second.cached);
    assert!(second.path.exists());
}

#[tokio::test]
async fn test_cache_index_survives_restart() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.cache = true;
    let request = CaptureRequest::new("http://example.com");

    let first = Capturer::new(config.clone())
        .await
        .unwrap()
        .capture(&request)
        .await
        .unwrap();
    let again = shotcache::capture(&request, &config).await.unwrap();

    assert_eq!(h.invocations(), 1);
    assert!(again.cached);
    assert_eq!(again.path, first.path);
}

#[tokio::test]
async fn test_empty_url_fails_before_spawn() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config(h.renderer(WRITE_ARTIFACT)))
        .await
        .unwrap();

    let result = capturer.capture(&CaptureRequest::new("")).await;
    assert!(matches!(result, Err(Error::MalformedRequest(_))));

    let result = capturer.capture(&CaptureRequest::new("http://exa mple.com")).await;
    assert!(matches!(result, Err(Error::MalformedRequest(_))));

    assert_eq!(h.invocations(), 0);
}

#[tokio::test]
async fn test_nonzero_exit_propagated() {
    let h = Harness::new();
    let mut config = h.config(h.renderer("exit 7"));
    config.cache = true;
    let capturer = Capturer::new(config).await.unwrap();
    let request = CaptureRequest::new("http://example.com");

    let outcome = capturer.capture(&request).await.unwrap();
    assert_eq!(outcome.status, RenderStatus::Exited(7));
    assert_eq!(outcome.status.code(), 7);
    assert!(outcome.error.is_some());
    assert!(!outcome.path.exists());

    // Failures are never cached
    capturer.capture(&request).await.unwrap();
    assert_eq!(h.invocations(), 2);
    assert!(capturer.index().is_empty().await);
}

#[tokio::test]
async fn test_clean_exit_without_artifact() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config(h.renderer("exit 0")))
        .await
        .unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::MissingArtifact);
    assert_ne!(outcome.status.code(), 0);
}

#[tokio::test]
async fn test_timeout_kills_renderer() {
    let h = Harness::new();
    let mut config = h.config(h.renderer("echo $$ > \"$WORK/pid\"\nexec sleep 30"));
    config.timeout_ms = 500;
    let capturer = Capturer::new(config).await.unwrap();

    let start = std::time::Instant::now();
    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::Timeout);
    assert_eq!(outcome.status.code(), 124);
    assert!(start.elapsed() < std::time::Duration::from_secs(10));

    if let Ok(pid) = std::fs::read_to_string(h.path("pid")) {
        let proc_entry = PathBuf::from(format!("/proc/{}", pid.trim()));
        if Path::new("/proc/self").exists() {
            assert!(!proc_entry.exists(), "renderer {} still present", pid.trim());
        }
    }
}

#[tokio::test]
async fn test_spawn_failure() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config("/nonexistent/shotcache-render".to_string()))
        .await
        .unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::SpawnFailed);
    assert_eq!(outcome.status.code(), 127);
    assert!(!outcome.path.exists());
}

#[tokio::test]
async fn test_compression_failure_keeps_success() {
    let h = Harness::new();
    let mut config = h.config(h.renderer("printf 'not a png' > \"$3\""));
    config.compress = true;
    let capturer = Capturer::new(config).await.unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::Success);
    assert_eq!(std::fs::read(&outcome.path).unwrap(), b"not a png");
}

#[tokio::test]
async fn test_compression_keeps_image_intact() {
    let h = Harness::new();
    let fixture = h.path("fixture.png");
    write_png(&fixture);
    let original = image::open(&fixture).unwrap().to_rgba8();

    let mut config = h.config(h.renderer(&format!("cp \"{}\" \"$3\"", fixture.display())));
    config.compress = true;
    let capturer = Capturer::new(config).await.unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RenderStatus::Success);
    assert_eq!(image::open(&outcome.path).unwrap().to_rgba8(), original);
}

#[tokio::test]
async fn test_config_defaults_reach_payload() {
    let h = Harness::new();
    let mut config = h.config(h.renderer(WRITE_ARTIFACT));
    config.options = PageSettings {
        width: Some(800),
        format: Some("jpeg".to_string()),
        ..Default::default()
    };
    let capturer = Capturer::new(config).await.unwrap();

    let outcome = capturer
        .capture(&CaptureRequest::new("http://example.com").element("banner"))
        .await
        .unwrap();

    assert!(outcome.path.to_string_lossy().ends_with(".jpeg"));
    let payload = h.payload();
    assert_eq!(payload["width"], 800);
    assert_eq!(payload["format"], "jpeg");
    assert_eq!(payload["elementid"], "banner");
}

#[tokio::test]
async fn test_concurrent_captures_are_independent() {
    let h = Harness::new();
    let capturer = Capturer::new(h.config(h.renderer("printf 'artifact' > \"$3\"")))
        .await
        .unwrap();

    let requests: Vec<CaptureRequest> = (0..8)
        .map(|i| CaptureRequest::new(format!("http://example.com/{}", i)))
        .collect();
    let outcomes =
        futures::future::join_all(requests.iter().map(|r| capturer.capture(r))).await;

    let mut paths = std::collections::HashSet::new();
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, RenderStatus::Success);
        assert!(paths.insert(outcome.path));
    }
    assert_eq!(h.invocations(), 8);
}
