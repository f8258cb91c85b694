//! Live Chromium driver over CDP (`chromiumoxide`).
//!
//! Every context is its own browser process with a throwaway profile
//! directory, so cookie jars never leak between a restore attempt and a fresh
//! login.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie as CdpCookie, CookieParam, CookieSameSite, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AutomationContext, AutomationPage, BrowserDriver, WaitPolicy};
use crate::classify::{ElementInfo, HtmlSnapshot, HIDDEN_MARKER_ATTR};
use crate::core::error::{BrowserError, BrowserResult};
use crate::core::types::{Cookie, SameSite, SessionSnapshot};

const NETWORK_IDLE_QUIET_MS: u64 = 500;
const NETWORK_IDLE_TIMEOUT_MS: u64 = 15_000;

static PROFILE_COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var
/// 2. PATH lookup via `which`
/// 3. OS-specific well-known install paths
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    for exe in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "brave-browser",
        "chrome",
    ] {
        if let Ok(found) = which::which(exe) {
            return Some(found.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    let candidates: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
    ];
    #[cfg(target_os = "linux")]
    let candidates: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/local/bin/chromium",
        "/snap/bin/chromium",
    ];
    #[cfg(target_os = "windows")]
    let candidates: &[&str] = &[
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
    ];
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    let candidates: &[&str] = &[];

    candidates
        .iter()
        .find(|c| Path::new(c).exists())
        .map(|c| c.to_string())
}

// ── Driver ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable: Option<String>,
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            width: 1366,
            height: 900,
            user_agent: None,
        }
    }
}

pub struct ChromiumDriver {
    exe: String,
    settings: BrowserSettings,
}

impl ChromiumDriver {
    /// Resolve the browser executable. Processes start per context.
    pub fn launch(settings: BrowserSettings) -> BrowserResult<Self> {
        let exe = settings
            .executable
            .clone()
            .or_else(find_chrome_executable)
            .ok_or_else(|| {
                BrowserError::Launch(
                    "no Chromium-family browser found; install one or set CHROME_EXECUTABLE"
                        .to_string(),
                )
            })?;
        info!("browser: using {}", exe);
        Ok(Self { exe, settings })
    }

    fn build_config(&self, profile_dir: &Path) -> BrowserResult<BrowserConfig> {
        let s = &self.settings;
        let mut builder = BrowserConfig::builder()
            .chrome_executable(&self.exe)
            .user_data_dir(profile_dir)
            .viewport(Viewport {
                width: s.width,
                height: s.height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .window_size(s.width, s.height)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--mute-audio")
            .arg("--disable-blink-features=AutomationControlled");
        if let Some(ua) = &s.user_agent {
            builder = builder.arg(format!("--user-agent={}", ua));
        }
        if !s.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(BrowserError::Launch)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn new_context(
        &self,
        seed: Option<&SessionSnapshot>,
    ) -> BrowserResult<Box<dyn AutomationContext>> {
        let n = PROFILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let profile_dir =
            std::env::temp_dir().join(format!("authgate-profile-{}-{}", std::process::id(), n));
        tokio::fs::create_dir_all(&profile_dir).await?;

        let config = self.build_config(&profile_dir)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(format!("{} ({})", e, self.exe)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("browser: CDP handler error: {}", e);
                }
            }
        });

        debug!(
            "browser: context {} launched (seeded={})",
            profile_dir.display(),
            seed.is_some()
        );
        Ok(Box::new(ChromiumContext {
            browser: Some(browser),
            handler: handler_task,
            profile_dir,
            seed: seed.cloned(),
            pages: Vec::new(),
        }))
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

struct ChromiumContext {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    seed: Option<SessionSnapshot>,
    pages: Vec<Arc<ChromiumPage>>,
}

impl ChromiumContext {
    async fn apply_seed(&self, page: &ChromiumPage, seed: &SessionSnapshot) -> BrowserResult<()> {
        let params: Vec<CookieParam> = seed.cookies.iter().map(to_cookie_param).collect();
        if !params.is_empty() {
            page.page
                .set_cookies(params)
                .await
                .map_err(|e| BrowserError::Interaction(format!("set_cookies: {e}")))?;
        }

        for (origin, items) in &seed.storage_by_origin {
            if items.is_empty() {
                continue;
            }
            if let Err(e) = page.goto(origin, WaitPolicy::Load).await {
                warn!("browser: cannot open {} to restore storage: {}", origin, e);
                continue;
            }
            let script = format!(
                "((origin, items) => {{ if (location.origin !== origin) return false; \
                 for (const [k, v] of Object.entries(items)) localStorage.setItem(k, v); \
                 return true; }})({}, {})",
                json!(origin),
                json!(items)
            );
            let applied = page.evaluate(&script).await?.as_bool().unwrap_or(false);
            if !applied {
                warn!("browser: {} redirected away; storage for it not restored", origin);
            }
        }
        info!(
            "browser: seeded {} cookies, {} storage items",
            seed.cookies.len(),
            seed.storage_item_count()
        );
        Ok(())
    }
}

#[async_trait]
impl AutomationContext for ChromiumContext {
    async fn new_page(&mut self) -> BrowserResult<Arc<dyn AutomationPage>> {
        let browser = self.browser.as_ref().ok_or(BrowserError::Closed)?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Interaction(format!("new_page: {e}")))?;
        let page = Arc::new(ChromiumPage { page });
        if self.pages.is_empty() {
            if let Some(seed) = &self.seed {
                self.apply_seed(&page, seed).await?;
            }
        }
        self.pages.push(page.clone());
        Ok(page)
    }

    async fn export_snapshot(&self) -> BrowserResult<SessionSnapshot> {
        let page = self.pages.last().ok_or(BrowserError::Closed)?;
        let cookies = page
            .page
            .get_cookies()
            .await
            .map_err(|e| BrowserError::Interaction(format!("get_cookies: {e}")))?;

        let mut storage: BTreeMap<String, BTreeMap<String, String>> = self
            .seed
            .as_ref()
            .map(|s| s.storage_by_origin.clone())
            .unwrap_or_default();
        let current = page
            .evaluate(
                "(() => { try { \
                 return { origin: location.origin, items: Object.assign({}, localStorage) }; \
                 } catch (_) { return null; } })()",
            )
            .await?;
        if let Some(origin) = current.get("origin").and_then(Value::as_str) {
            if origin.starts_with("http") {
                let items: BTreeMap<String, String> = current
                    .get("items")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                storage.insert(origin.to_string(), items);
            }
        }

        Ok(SessionSnapshot::new(
            cookies.iter().map(from_cdp_cookie).collect(),
            storage,
        ))
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.pages.clear();
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("browser: close error (non-fatal): {}", e);
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!("browser: profile cleanup {}: {}", self.profile_dir.display(), e);
        }
        Ok(())
    }
}

impl Drop for ChromiumContext {
    fn drop(&mut self) {
        self.handler.abort();
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dir = self.profile_dir.clone();
        handle.spawn(async move {
            let _ = browser.close().await;
            let _ = browser.wait().await;
            let _ = tokio::fs::remove_dir_all(dir).await;
        });
    }
}

fn to_cookie_param(c: &Cookie) -> CookieParam {
    let mut p = CookieParam::new(c.name.clone(), c.value.clone());
    p.domain = Some(c.domain.clone());
    p.path = Some(c.path.clone());
    p.secure = Some(c.secure);
    p.http_only = Some(c.http_only);
    p.same_site = Some(match c.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    });
    p.expires = c
        .expiry
        .map(|t| TimeSinceEpoch::new(t.timestamp_millis() as f64 / 1000.0));
    p
}

fn from_cdp_cookie(c: &CdpCookie) -> Cookie {
    let expiry = if c.session || c.expires <= 0.0 {
        None
    } else {
        Utc.timestamp_millis_opt((c.expires * 1000.0) as i64).single()
    };
    Cookie {
        name: c.name.clone(),
        value: c.value.clone(),
        domain: c.domain.clone(),
        path: c.path.clone(),
        expiry,
        http_only: c.http_only,
        secure: c.secure,
        same_site: match c.same_site {
            Some(CookieSameSite::Strict) => SameSite::Strict,
            Some(CookieSameSite::None) => SameSite::None,
            _ => SameSite::Lax,
        },
    }
}

// ── Page ─────────────────────────────────────────────────────────────────────

struct ChromiumPage {
    page: Page,
}

const SNAPSHOT_JS: &str = r#"(() => {
  const MARK = '__MARK__';
  document.querySelectorAll('[' + MARK + ']').forEach(el => el.removeAttribute(MARK));
  const all = document.body ? document.body.querySelectorAll('*') : [];
  for (const el of all) {
    const st = window.getComputedStyle(el);
    if (st.display === 'none' || st.visibility === 'hidden') {
      el.setAttribute(MARK, '1');
    }
  }
  return {
    url: location.href,
    title: document.title || '',
    html: document.documentElement ? document.documentElement.outerHTML : '',
    text: document.body ? document.body.innerText : ''
  };
})()"#;

const VISIBLE_FN_JS: &str = "const __visible = (el) => { const st = getComputedStyle(el); \
    const r = el.getBoundingClientRect(); \
    return st.display !== 'none' && st.visibility !== 'hidden' && r.width > 0 && r.height > 0; };";

/// Attribute placed on the element an interaction is about to act on.
const TARGET_MARKER_ATTR: &str = "data-authgate-target";

/// Moves [`TARGET_MARKER_ATTR`] onto the first rendered match of `selector`.
/// Evaluates to `false` when no match is rendered.
fn mark_target_script(selector: &str) -> String {
    format!(
        "((sel, mark) => {{ {VISIBLE_FN_JS} \
         for (const old of document.querySelectorAll('[' + mark + ']')) old.removeAttribute(mark); \
         const el = Array.from(document.querySelectorAll(sel)).find(__visible); \
         if (!el) return false; el.setAttribute(mark, ''); return true; }})({}, {})",
        json!(selector),
        json!(TARGET_MARKER_ATTR)
    )
}

impl ChromiumPage {
    /// Polls resource-entry count until it stops changing for a quiet window.
    async fn wait_network_idle(&self) {
        let start = tokio::time::Instant::now();
        let mut last_count: u64 = 0;
        let mut stable_since = tokio::time::Instant::now();
        loop {
            if start.elapsed() >= Duration::from_millis(NETWORK_IDLE_TIMEOUT_MS) {
                debug!("browser: network idle timeout after {}ms", NETWORK_IDLE_TIMEOUT_MS);
                break;
            }
            let state = self
                .evaluate(
                    "({ count: performance.getEntriesByType('resource').length, \
                     ready: document.readyState })",
                )
                .await
                .unwrap_or(Value::Null);
            let count = state.get("count").and_then(Value::as_u64).unwrap_or(0);
            let ready = state.get("ready").and_then(Value::as_str) == Some("complete");

            if !ready || count != last_count {
                last_count = count;
                stable_since = tokio::time::Instant::now();
            } else if stable_since.elapsed() >= Duration::from_millis(NETWORK_IDLE_QUIET_MS) {
                debug!(
                    "browser: idle after {}ms ({} resources)",
                    start.elapsed().as_millis(),
                    count
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Handle to the first rendered match of `selector`; hidden duplicates
    /// earlier in the document are skipped.
    async fn element(&self, selector: &str) -> BrowserResult<chromiumoxide::Element> {
        let marked = self.evaluate(&mark_target_script(selector)).await?;
        if marked.as_bool() != Some(true) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.page
            .find_element(format!("[{TARGET_MARKER_ATTR}]"))
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))
    }
}

#[async_trait]
impl AutomationPage for ChromiumPage {
    async fn goto(&self, url: &str, wait: WaitPolicy) -> BrowserResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        self.settle(wait).await
    }

    async fn reload(&self, wait: WaitPolicy) -> BrowserResult<()> {
        let url = self.current_url().await?;
        self.goto(&url, wait).await
    }

    async fn settle(&self, wait: WaitPolicy) -> BrowserResult<()> {
        match wait {
            WaitPolicy::Load => {
                let _ = self.page.wait_for_navigation().await;
            }
            WaitPolicy::NetworkIdle => self.wait_network_idle().await,
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self
            .evaluate("location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn query_selector(&self, selector: &str) -> BrowserResult<Option<ElementInfo>> {
        let script = format!(
            "((sel) => {{ {VISIBLE_FN_JS} const all = Array.from(document.querySelectorAll(sel)); \
             const el = all.find(__visible) || all[0]; if (!el) return null; \
             const text = (el.innerText || el.value || el.getAttribute('aria-label') || '') \
               .trim(); \
             return {{ text, visible: __visible(el) }}; }})({})",
            json!(selector)
        );
        let v = self.evaluate(&script).await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(ElementInfo {
            text: v.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            visible: v.get("visible").and_then(Value::as_bool).unwrap_or(false),
        }))
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        // Focus through a real click first so frameworks see user activation.
        // `element` leaves the target mark on the field the value goes into.
        self.element(selector)
            .await?
            .click()
            .await
            .map_err(|e| BrowserError::Interaction(format!("focus {selector}: {e}")))?;
        let script = format!(
            "((mark, val) => {{ const el = document.querySelector('[' + mark + ']'); \
             if (!el) return false; el.focus(); \
             const proto = el instanceof HTMLTextAreaElement \
               ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype; \
             const setter = Object.getOwnPropertyDescriptor(proto, 'value').set; \
             setter.call(el, val); \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})({}, {})",
            json!(TARGET_MARKER_ATTR),
            json!(value)
        );
        match self.evaluate(&script).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(BrowserError::ElementNotFound(selector.to_string())),
        }
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.element(selector)
            .await?
            .click()
            .await
            .map_err(|e| BrowserError::Interaction(format!("click {selector}: {e}")))?;
        Ok(())
    }

    async fn click_text(&self, scope: &str, labels: &[String]) -> BrowserResult<Option<String>> {
        let script = format!(
            "((scope, labels) => {{ {VISIBLE_FN_JS} \
             const norm = (s) => (s || '').trim().toLowerCase().replace(/\\s+/g, ' '); \
             const wanted = labels.map(norm).filter(Boolean); \
             for (const el of document.querySelectorAll(scope)) {{ \
               if (!__visible(el)) continue; \
               const label = norm(el.innerText || el.value || el.getAttribute('aria-label')); \
               if (wanted.some((w) => label === w || label.startsWith(w + ' '))) {{ \
                 el.click(); return label; \
               }} \
             }} return null; }})({}, {})",
            json!(scope),
            json!(labels)
        );
        Ok(self
            .evaluate(&script)
            .await?
            .as_str()
            .map(|s| s.to_string()))
    }

    async fn press_enter(&self, selector: &str) -> BrowserResult<()> {
        self.element(selector)
            .await?
            .press_key("Enter")
            .await
            .map_err(|e| BrowserError::Interaction(format!("enter in {selector}: {e}")))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn snapshot(&self) -> BrowserResult<HtmlSnapshot> {
        let v = self
            .evaluate(&SNAPSHOT_JS.replace("__MARK__", HIDDEN_MARKER_ATTR))
            .await?;
        let field = |k: &str| v.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(HtmlSnapshot::new(
            field("url"),
            field("title"),
            field("html"),
            Some(field("text")),
        ))
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| BrowserError::Interaction(format!("screenshot: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_param_carries_expiry_and_flags() {
        let mut c = Cookie::new("sid", "v", ".example.com");
        c.secure = true;
        c.same_site = SameSite::Strict;
        c.expiry = Utc.timestamp_opt(1_900_000_000, 0).single();
        let p = to_cookie_param(&c);
        assert_eq!(p.domain.as_deref(), Some(".example.com"));
        assert_eq!(p.secure, Some(true));
        assert!(matches!(p.same_site, Some(CookieSameSite::Strict)));
        assert!(p.expires.is_some());
    }

    #[test]
    fn session_cookie_has_no_expiry_param() {
        let p = to_cookie_param(&Cookie::new("a", "b", "x.com"));
        assert!(p.expires.is_none());
    }

    #[test]
    fn snapshot_script_uses_hidden_marker() {
        let js = SNAPSHOT_JS.replace("__MARK__", HIDDEN_MARKER_ATTR);
        assert!(js.contains(HIDDEN_MARKER_ATTR));
        assert!(!js.contains("__MARK__"));
    }

    #[test]
    fn target_script_marks_first_rendered_match() {
        let js = mark_target_script("input[name='username']");
        assert!(js.contains(r#"("input[name='username']", "data-authgate-target")"#));
        assert!(js.contains("const __visible"));
        assert!(js.contains(".find(__visible)"));
        assert!(js.contains("old.removeAttribute(mark)"));
    }
}
