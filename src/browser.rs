use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

use crate::action::InputMode;
use crate::coords::{Point, Viewport};

const JPEG_QUALITY: u8 = 90;
const FOCUS_SETTLE: Duration = Duration::from_millis(500);
const SCROLL_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 800) }
    }
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per run avoids ProcessSingleton lock conflicts.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("vision-pilot-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir).context("create profile dir")?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self { page, _browser: browser };
        this.set_viewport(cfg.viewport.0, cfg.viewport.1).await?;
        Ok(this)
    }

    /// Attaches to a running Chromium through its DevTools websocket and
    /// drives its first open page.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        Ok(Self { page, _browser: browser })
    }

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    /// Logical size of the window, in CSS pixels.
    pub async fn viewport(&self) -> Result<Viewport> {
        let viewport: Viewport = self
            .page
            .evaluate("({ width: window.innerWidth, height: window.innerHeight })")
            .await?
            .into_value()
            .context("viewport size")?;
        Ok(viewport)
    }

    pub async fn move_mouse(&self, at: Point) -> Result<()> {
        self.page.move_mouse(CdpPoint { x: at.x, y: at.y }).await?;
        Ok(())
    }

    pub async fn click(&self, at: Point, click_count: u32) -> Result<()> {
        debug!(x = at.x, y = at.y, click_count, "click");
        let cmd = DispatchMouseEventParams::builder()
            .x(at.x)
            .y(at.y)
            .button(MouseButton::Left)
            .click_count(click_count.max(1) as i64);
        self.move_mouse(at).await?;
        self.page
            .execute(
                cmd.clone()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .build()
                    .map_err(|e| anyhow!(e))?,
            )
            .await?;
        self.page
            .execute(
                cmd.r#type(DispatchMouseEventType::MouseReleased)
                    .build()
                    .map_err(|e| anyhow!(e))?,
            )
            .await?;
        Ok(())
    }

    /// Focuses `at` (when given) and enters `value` according to `mode`.
    pub async fn input(&self, at: Option<Point>, value: &str, mode: InputMode) -> Result<()> {
        if let Some(at) = at {
            // Three clicks select the field's existing text.
            let clicks = match mode {
                InputMode::Replace | InputMode::Clear => 3,
                InputMode::TypeOnly | InputMode::Append => 1,
            };
            self.click(at, clicks).await?;
            sleep(FOCUS_SETTLE).await;
        }
        match mode {
            InputMode::Clear => return self.press_key("Backspace", 8).await,
            InputMode::Append => self.press_key("End", 35).await?,
            InputMode::Replace | InputMode::TypeOnly => {}
        }
        if !value.is_empty() {
            self.type_text(value).await?;
        }
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    pub async fn press_key(&self, key: &str, key_code: i64) -> Result<()> {
        for kind in [DispatchKeyEventType::RawKeyDown, DispatchKeyEventType::KeyUp] {
            let params = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(key)
                .code(key)
                .windows_virtual_key_code(key_code)
                .native_virtual_key_code(key_code)
                .build()
                .map_err(|e| anyhow!(e))?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    /// Wheel-scrolls over `at`, or scrolls the window when no point is given.
    pub async fn scroll(&self, at: Option<Point>, dx: f64, dy: f64, repeat: u32) -> Result<()> {
        for i in 0..repeat.max(1) {
            if i > 0 {
                sleep(SCROLL_PAUSE).await;
            }
            match at {
                Some(at) => {
                    self.move_mouse(at).await?;
                    let wheel = DispatchMouseEventParams::builder()
                        .r#type(DispatchMouseEventType::MouseWheel)
                        .x(at.x)
                        .y(at.y)
                        .delta_x(dx)
                        .delta_y(dy)
                        .build()
                        .map_err(|e| anyhow!(e))?;
                    self.page.execute(wheel).await?;
                }
                None => {
                    let eval = EvaluateParams::builder()
                        .expression(format!("window.scrollBy({dx}, {dy});"))
                        .build()
                        .map_err(|e| anyhow!(e))?;
                    self.page.execute(eval).await?;
                }
            }
        }
        Ok(())
    }

    /// JPEG of the visible page scaled to the logical viewport, so that box
    /// coordinates from the model line up with CSS pixels.
    pub async fn screenshot_b64(&self, viewport: Viewport) -> Result<String> {
        let bytes = self
            .page
            .screenshot(
                ScreenshotParamsBuilder::default()
                    .format(CaptureScreenshotFormat::Jpeg)
                    .quality(JPEG_QUALITY as i64)
                    .build(),
            )
            .await?;
        let fitted = fit_to_viewport(
            &bytes,
            viewport.width.round().max(1.0) as u32,
            viewport.height.round().max(1.0) as u32,
        )?;
        Ok(STANDARD.encode(fitted))
    }
}

/// Re-encodes `bytes` at exactly `width` x `height` when the capture was
/// taken at a different (device pixel) size.
pub fn fit_to_viewport(bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("decode screenshot")?;
    if img.dimensions() == (width, height) {
        return Ok(bytes.to_vec());
    }
    let resized = img.resize_exact(width, height, FilterType::Triangle);
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .context("encode screenshot")?;
    Ok(out.into_inner())
}
