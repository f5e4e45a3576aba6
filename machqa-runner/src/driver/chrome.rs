//! Chromium-backed browser session
//!
//! One [`ChromeDriver`] owns one headless browser and one page, bound to a
//! single worker for its whole lifetime. Audio is observed through a
//! monitor script installed before any document loads: it wraps the page's
//! `AudioContext`, taps everything routed to the destination through a pair
//! of analysers, and keeps a bounded queue of raw sample blocks that the
//! driver drains into an mpsc channel.

use super::{AudioChunk, ClickTarget, DriverError, UiDriver};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    ConsoleApiCalledType, EventConsoleApiCalled, EventExceptionThrown,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use image::imageops;
use image::RgbaImage;
use machqa_common::profile::CaptureScope;
use machqa_common::report::{ConsoleError, TargetTask};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Browser session settings from the runner configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    /// Target URL with a `{code}` placeholder for the machine code
    pub url_template: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 500,
            viewport_height: 859,
            user_agent: Some(
                "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) \
                 AppleWebKit/537.36 (KHTML, like Gecko) Chrome/85.0.4183.127 Mobile Safari/537.36"
                    .to_string(),
            ),
            url_template: "http://127.0.0.1:8080/play?code={code}".to_string(),
        }
    }
}

/// Installed before any document script runs; must exist before the game
/// constructs its AudioContext or there is nothing to tap.
const AUDIO_MONITOR_SCRIPT: &str = r#"
(() => {
  if (window.__audioProbeInstalled) return;
  window.__audioProbeInstalled = true;
  window.__audioProbe = { active: false, sampleRate: 0, samples: [], error: null };

  const Orig = window.AudioContext || window.webkitAudioContext;
  if (!Orig) {
    window.__audioProbe.error = 'AudioContext not supported';
    return;
  }

  const origConnect = AudioNode.prototype.connect;

  const Patched = function (...args) {
    const ctx = new Orig(...args);
    const probe = window.__audioProbe;
    probe.active = true;
    probe.sampleRate = ctx.sampleRate;

    const splitter = ctx.createChannelSplitter(2);
    const left = ctx.createAnalyser();
    const right = ctx.createAnalyser();
    left.fftSize = 2048;
    right.fftSize = 2048;

    const tap = ctx.createGain();
    tap.gain.value = 1.0;
    tap.connect(splitter);
    splitter.connect(left, 0);
    splitter.connect(right, 1);
    tap.connect(ctx.destination);

    AudioNode.prototype.connect = function (dest, ...rest) {
      if (dest === ctx.destination) {
        return origConnect.call(this, tap, ...rest);
      }
      return origConnect.call(this, dest, ...rest);
    };

    const bufLen = left.frequencyBinCount;
    const dataL = new Float32Array(bufLen);
    const dataR = new Float32Array(bufLen);
    setInterval(() => {
      if (ctx.state !== 'running') return;
      left.getFloatTimeDomainData(dataL);
      right.getFloatTimeDomainData(dataR);
      probe.samples.push({
        left: Array.from(dataL),
        right: Array.from(dataR),
        sampleRate: ctx.sampleRate
      });
      if (probe.samples.length > 50) probe.samples.shift();
    }, 200);

    return ctx;
  };

  Patched.prototype = Orig.prototype;
  window.AudioContext = Patched;
  if (window.webkitAudioContext) window.webkitAudioContext = Patched;
})();
"#;

const DRAIN_SAMPLES_JS: &str = r#"
(() => {
  const probe = window.__audioProbe;
  if (!probe) return [];
  const out = probe.samples;
  probe.samples = [];
  return out;
})()
"#;

const RESET_SAMPLES_JS: &str =
    "window.__audioProbe ? (window.__audioProbe.samples = [], true) : false";

/// One sample block drained from the page monitor
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeSample {
    #[serde(default)]
    left: Vec<f32>,
    #[serde(default)]
    right: Vec<f32>,
    #[serde(default)]
    sample_rate: u32,
}

/// chromiumoxide-backed [`UiDriver`] implementation
pub struct ChromeDriver {
    browser: Browser,
    page: Page,
    url_template: String,
    console_errors: Arc<Mutex<Vec<ConsoleError>>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl ChromeDriver {
    /// Launch a browser and open the session page
    pub async fn launch(settings: &BrowserSettings) -> Result<Self, DriverError> {
        let mut builder = BrowserConfig::builder()
            .window_size(settings.viewport_width, settings.viewport_height);
        if !settings.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::Action)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Action(format!("browser launch: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Action(format!("open page: {e}")))?;

        if let Some(user_agent) = &settings.user_agent {
            page.set_user_agent(user_agent.as_str())
                .await
                .map_err(|e| DriverError::Action(format!("set user agent: {e}")))?;
        }

        let install = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(AUDIO_MONITOR_SCRIPT)
            .build()
            .map_err(DriverError::Action)?;
        page.execute(install)
            .await
            .map_err(|e| DriverError::Action(format!("install audio monitor: {e}")))?;

        let console_errors = Arc::new(Mutex::new(Vec::new()));
        let mut background_tasks = vec![handler_task];
        background_tasks.push(spawn_console_listener(&page, Arc::clone(&console_errors)).await?);
        background_tasks.push(spawn_exception_listener(&page, Arc::clone(&console_errors)).await?);

        info!(
            headless = settings.headless,
            viewport = %format!("{}x{}", settings.viewport_width, settings.viewport_height),
            "Browser session ready"
        );

        Ok(Self {
            browser,
            page,
            url_template: settings.url_template.clone(),
            console_errors,
            background_tasks,
        })
    }

    /// Shut the session down, best effort
    pub async fn close(mut self) {
        for task in &self.background_tasks {
            task.abort();
        }
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
    }

    fn record_console(errors: &Mutex<Vec<ConsoleError>>, kind: &str, text: String) {
        let mut guard = errors.lock().expect("console error lock poisoned");
        guard.push(ConsoleError {
            kind: kind.to_string(),
            text,
        });
        // bound memory on very noisy pages
        let len = guard.len();
        if len > 500 {
            guard.drain(..len - 500);
        }
    }
}

async fn spawn_console_listener(
    page: &Page,
    errors: Arc<Mutex<Vec<ConsoleError>>>,
) -> Result<JoinHandle<()>, DriverError> {
    let mut events = page
        .event_listener::<EventConsoleApiCalled>()
        .await
        .map_err(|e| DriverError::Action(format!("console listener: {e}")))?;

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if !matches!(event.r#type, ConsoleApiCalledType::Error) {
                continue;
            }
            let text = event
                .args
                .iter()
                .filter_map(|arg| {
                    arg.value
                        .as_ref()
                        .map(|v| v.to_string())
                        .or_else(|| arg.description.clone())
                })
                .collect::<Vec<_>>()
                .join(" ");
            warn!(console = %text, "Console error");
            ChromeDriver::record_console(&errors, "console", text);
        }
    }))
}

async fn spawn_exception_listener(
    page: &Page,
    errors: Arc<Mutex<Vec<ConsoleError>>>,
) -> Result<JoinHandle<()>, DriverError> {
    let mut events = page
        .event_listener::<EventExceptionThrown>()
        .await
        .map_err(|e| DriverError::Action(format!("exception listener: {e}")))?;

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let details = &event.exception_details;
            let text = details
                .exception
                .as_ref()
                .and_then(|e| e.description.clone())
                .unwrap_or_else(|| details.text.clone());
            warn!(page_error = %text, "Page error");
            ChromeDriver::record_console(&errors, "pageerror", text);
        }
    }))
}

fn decode_png(bytes: &[u8]) -> Result<RgbaImage, DriverError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| DriverError::Capture(format!("decode screenshot: {e}")))
}

fn crop_region(
    frame: RgbaImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<RgbaImage, DriverError> {
    let (fw, fh) = frame.dimensions();
    if x >= fw || y >= fh {
        return Err(DriverError::Capture(format!(
            "region origin ({x},{y}) outside {fw}x{fh} frame"
        )));
    }
    let width = width.min(fw - x);
    let height = height.min(fh - y);
    if width == 0 || height == 0 {
        return Err(DriverError::Capture("empty capture region".to_string()));
    }
    Ok(imageops::crop_imm(&frame, x, y, width, height).to_image())
}

#[async_trait]
impl UiDriver for ChromeDriver {
    async fn navigate(&self, task: &TargetTask) -> Result<(), DriverError> {
        let url = self.url_template.replace("{code}", &task.code);
        debug!(code = %task.code, url = %url, "Navigating");

        self.page
            .goto(url.clone())
            .await
            .map_err(|e| DriverError::Action(format!("goto {url}: {e}")))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| DriverError::Action(format!("load {url}: {e}")))?;
        Ok(())
    }

    async fn capture_frame(&self, scope: &CaptureScope) -> Result<RgbaImage, DriverError> {
        match scope {
            CaptureScope::FullPage => {
                let bytes = self
                    .page
                    .screenshot(
                        ScreenshotParams::builder()
                            .format(CaptureScreenshotFormat::Png)
                            .build(),
                    )
                    .await
                    .map_err(|e| DriverError::Capture(format!("page screenshot: {e}")))?;
                decode_png(&bytes)
            }
            CaptureScope::Selector { selector } => {
                let element = self
                    .page
                    .find_element(selector.as_str())
                    .await
                    .map_err(|e| DriverError::Capture(format!("element '{selector}': {e}")))?;
                let bytes = element
                    .screenshot(CaptureScreenshotFormat::Png)
                    .await
                    .map_err(|e| {
                        DriverError::Capture(format!("screenshot of '{selector}': {e}"))
                    })?;
                decode_png(&bytes)
            }
            CaptureScope::Region {
                x,
                y,
                width,
                height,
            } => {
                let bytes = self
                    .page
                    .screenshot(
                        ScreenshotParams::builder()
                            .format(CaptureScreenshotFormat::Png)
                            .build(),
                    )
                    .await
                    .map_err(|e| DriverError::Capture(format!("page screenshot: {e}")))?;
                crop_region(decode_png(&bytes)?, *x, *y, *width, *height)
            }
        }
    }

    async fn capture_audio(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<AudioChunk>, DriverError> {
        // clear anything buffered before this capture window
        self.page
            .evaluate(RESET_SAMPLES_JS)
            .await
            .map_err(|e| DriverError::Capture(format!("reset audio monitor: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        let page = self.page.clone();

        tokio::spawn(async move {
            let poll_interval = Duration::from_millis(200);
            let deadline = tokio::time::Instant::now() + duration;

            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(poll_interval).await;

                let drained = match page.evaluate(DRAIN_SAMPLES_JS).await {
                    Ok(result) => result.into_value::<Vec<ProbeSample>>(),
                    Err(e) => {
                        warn!("Audio sample drain failed: {e}");
                        break;
                    }
                };
                let samples = match drained {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!("Audio sample decode failed: {e}");
                        break;
                    }
                };

                for sample in samples {
                    let chunk = AudioChunk {
                        left: sample.left,
                        right: sample.right,
                        sample_rate: sample.sample_rate,
                    };
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
            // dropping tx closes the channel, ending the analysis
        });

        Ok(rx)
    }

    async fn perform_click(&self, target: &ClickTarget) -> Result<(), DriverError> {
        match target {
            ClickTarget::Selector(selector) => {
                let element = self
                    .page
                    .find_element(selector.as_str())
                    .await
                    .map_err(|e| DriverError::Action(format!("element '{selector}': {e}")))?;
                element
                    .click()
                    .await
                    .map_err(|e| DriverError::Action(format!("click '{selector}': {e}")))?;
            }
            ClickTarget::Position { x, y } => {
                let press = DispatchMouseEventParams::builder()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .x(*x)
                    .y(*y)
                    .button(MouseButton::Left)
                    .click_count(1)
                    .build()
                    .map_err(DriverError::Action)?;
                self.page
                    .execute(press)
                    .await
                    .map_err(|e| DriverError::Action(format!("press at {x},{y}: {e}")))?;

                let release = DispatchMouseEventParams::builder()
                    .r#type(DispatchMouseEventType::MouseReleased)
                    .x(*x)
                    .y(*y)
                    .button(MouseButton::Left)
                    .click_count(1)
                    .build()
                    .map_err(DriverError::Action)?;
                self.page
                    .execute(release)
                    .await
                    .map_err(|e| DriverError::Action(format!("release at {x},{y}: {e}")))?;
            }
        }
        Ok(())
    }

    async fn drain_console_errors(&self) -> Vec<ConsoleError> {
        let mut guard = self.console_errors.lock().expect("console error lock poisoned");
        std::mem::take(&mut *guard)
    }
}
