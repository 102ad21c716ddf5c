use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, viewport: (1280, 800) }
    }
}

/// A single Chromium page used as the operated screen.
pub struct Browser {
    page: Page,
    viewport: (u32, u32),
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Fresh profile per launch; Chromium refuses a second instance on a locked profile.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("self-operate-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::with_page(browser, cfg.viewport).await
    }

    pub async fn connect(ws_url: &str, viewport: (u32, u32)) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::with_page(browser, viewport).await
    }

    async fn with_page(browser: OxideBrowser, viewport: (u32, u32)) -> Result<Self> {
        let page = browser.new_page("about:blank").await?;
        let this = Self { page, viewport, _browser: browser };
        this.force_viewport().await?;
        Ok(this)
    }

    // A zero-sized viewport makes screenshots fail.
    async fn force_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
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

    pub async fn click(&self, x: i64, y: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .move_mouse(Point { x: x as f64, y: y as f64 })
            .await?
            .execute(pressed)
            .await?;
        self.page.execute(released).await?;
        Ok(())
    }

    /// Holds every key down in order, then releases them in reverse (a chord).
    pub async fn press_keys(&self, keys: &[String]) -> Result<()> {
        for event in chord_events(keys)? {
            self.page.execute(event).await?;
        }
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.force_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }
}

const ALT: i64 = 1;
const CTRL: i64 = 2;
const META: i64 = 4;
const SHIFT: i64 = 8;

/// One physical key as Chromium's input pipeline expects it.
#[derive(Clone, Debug, PartialEq)]
struct KeyDef {
    key: String,
    code: String,
    key_code: i64,
    text: Option<String>,
}

impl KeyDef {
    fn named(key: &str, code: &str, key_code: i64, text: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            code: code.to_string(),
            key_code,
            text: text.map(str::to_string),
        }
    }

    fn modifier(&self) -> i64 {
        match self.key.as_str() {
            "Alt" => ALT,
            "Control" => CTRL,
            "Meta" => META,
            "Shift" => SHIFT,
            _ => 0,
        }
    }

    // Shift turns letters upper-case; the key code stays the same.
    fn shifted(&self) -> Self {
        let mut def = self.clone();
        if def.code.starts_with("Key") {
            def.key = def.key.to_ascii_uppercase();
            def.text = def.text.map(|t| t.to_ascii_uppercase());
        }
        def
    }
}

/// Keydown/keyup sequence for a chord. Text is only attached when no
/// modifier other than shift is held, so ctrl+a selects instead of typing.
fn chord_events(keys: &[String]) -> Result<Vec<DispatchKeyEventParams>> {
    let defs: Vec<KeyDef> = keys.iter().map(|k| key_def(k)).collect();
    let mut events = Vec::with_capacity(defs.len() * 2);
    let mut modifiers = 0i64;
    let mut held = Vec::with_capacity(defs.len());

    for def in defs {
        modifiers |= def.modifier();
        let def = if modifiers & SHIFT != 0 { def.shifted() } else { def };
        let text = def.text.clone().filter(|_| modifiers & !SHIFT == 0);
        let mut down = DispatchKeyEventParams::builder()
            .r#type(if text.is_some() {
                DispatchKeyEventType::KeyDown
            } else {
                DispatchKeyEventType::RawKeyDown
            })
            .key(def.key.clone())
            .code(def.code.clone())
            .windows_virtual_key_code(def.key_code)
            .native_virtual_key_code(def.key_code)
            .modifiers(modifiers);
        if let Some(text) = text {
            down = down.text(text.clone()).unmodified_text(text);
        }
        events.push(down.build().map_err(|e| anyhow!(e))?);
        held.push(def);
    }
    for def in held.iter().rev() {
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(def.key.clone())
            .code(def.code.clone())
            .windows_virtual_key_code(def.key_code)
            .native_virtual_key_code(def.key_code)
            .modifiers(modifiers)
            .build()
            .map_err(|e| anyhow!(e))?;
        events.push(up);
        modifiers &= !def.modifier();
    }
    Ok(events)
}

/// Maps the loose key names models produce onto a US keyboard layout.
fn key_def(raw: &str) -> KeyDef {
    // A bare " " means the space bar.
    let trimmed = match raw.trim() {
        "" if !raw.is_empty() => " ",
        t => t,
    };
    match trimmed.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => KeyDef::named("Control", "ControlLeft", 17, None),
        "cmd" | "command" | "win" | "super" | "meta" => KeyDef::named("Meta", "MetaLeft", 91, None),
        "alt" | "option" => KeyDef::named("Alt", "AltLeft", 18, None),
        "shift" => KeyDef::named("Shift", "ShiftLeft", 16, None),
        "enter" | "return" => KeyDef::named("Enter", "Enter", 13, Some("\r")),
        "esc" | "escape" => KeyDef::named("Escape", "Escape", 27, None),
        "tab" => KeyDef::named("Tab", "Tab", 9, None),
        "space" | " " => KeyDef::named(" ", "Space", 32, Some(" ")),
        "backspace" => KeyDef::named("Backspace", "Backspace", 8, None),
        "delete" | "del" => KeyDef::named("Delete", "Delete", 46, None),
        "insert" => KeyDef::named("Insert", "Insert", 45, None),
        "up" | "arrowup" => KeyDef::named("ArrowUp", "ArrowUp", 38, None),
        "down" | "arrowdown" => KeyDef::named("ArrowDown", "ArrowDown", 40, None),
        "left" | "arrowleft" => KeyDef::named("ArrowLeft", "ArrowLeft", 37, None),
        "right" | "arrowright" => KeyDef::named("ArrowRight", "ArrowRight", 39, None),
        "home" => KeyDef::named("Home", "Home", 36, None),
        "end" => KeyDef::named("End", "End", 35, None),
        "pageup" => KeyDef::named("PageUp", "PageUp", 33, None),
        "pagedown" => KeyDef::named("PageDown", "PageDown", 34, None),
        lower => function_key(lower).unwrap_or_else(|| char_key(trimmed)),
    }
}

fn function_key(lower: &str) -> Option<KeyDef> {
    let n: i64 = lower.strip_prefix('f')?.parse().ok()?;
    if !(1..=12).contains(&n) {
        return None;
    }
    let name = format!("F{n}");
    Some(KeyDef::named(&name, &name, 111 + n, None))
}

fn char_key(raw: &str) -> KeyDef {
    let mut chars = raw.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        // Multi-character names we don't know are passed through as-is.
        return KeyDef::named(raw, "", 0, None);
    };
    let text = c.to_string();
    let (code, key_code) = match c {
        'a'..='z' | 'A'..='Z' => {
            let upper = c.to_ascii_uppercase();
            (format!("Key{upper}"), upper as i64)
        }
        '0'..='9' => (format!("Digit{c}"), c as i64),
        _ => {
            let (code, key_code) = match c {
                '-' => ("Minus", 189),
                '=' => ("Equal", 187),
                ',' => ("Comma", 188),
                '.' => ("Period", 190),
                '/' => ("Slash", 191),
                ';' => ("Semicolon", 186),
                '\'' => ("Quote", 222),
                '[' => ("BracketLeft", 219),
                ']' => ("BracketRight", 221),
                '\\' => ("Backslash", 220),
                '`' => ("Backquote", 192),
                _ => ("", 0),
            };
            (code.to_string(), key_code)
        }
    };
    KeyDef { key: text.clone(), code, key_code, text: Some(text) }
}
