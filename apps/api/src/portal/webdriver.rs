//! `PortalPage` over a WebDriver (chromedriver) session.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thirtyfour::prelude::*;
use thirtyfour::{ChromeCapabilities, ChromiumLikeCapabilities};
use tracing::debug;

use super::page::{LabelStrategy, PageError, PageFactory, PortalPage, Question};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36";

const IDLE_POLLS: u32 = 40;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SETTLE: Duration = Duration::from_millis(500);

/// Hides the usual automation fingerprints from page scripts.
const STEALTH_JS: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

const RESOLVE_LABEL_JS: &str = r#"
const [wanted, strategy, tag] = arguments;
const norm = (s) => (s || '').replace(/[*:]/g, ' ').replace(/\s+/g, ' ').trim().toLowerCase();
const isControl = (el) => el && el.matches && el.matches('input:not([type=hidden]), textarea, select');
const labels = [...document.querySelectorAll('label')].filter((l) => norm(l.innerText) === norm(wanted));
if (labels.length !== 1) return null;
const label = labels[0];
let target = null;
if (strategy === 'for') {
  if (label.htmlFor) target = document.getElementById(label.htmlFor);
} else {
  target = label.querySelector('input:not([type=hidden]), textarea, select');
  let sib = label.nextElementSibling;
  while (!target && sib) {
    if (isControl(sib)) { target = sib; break; }
    const inner = sib.querySelector && sib.querySelector('input:not([type=hidden]), textarea, select');
    if (inner) { target = inner; break; }
    sib = sib.nextElementSibling;
  }
}
if (!isControl(target)) return null;
target.setAttribute('data-jp-field', tag);
return `[data-jp-field="${tag}"]`;
"#;

const QUESTIONS_JS: &str = r#"
const [scopeSel, prefix] = arguments;
const scope = document.querySelector(scopeSel);
if (!scope) return [];
const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
const visible = (el) => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
const labelOf = (el) => {
  if (el.id) {
    const l = document.querySelector(`label[for="${CSS.escape(el.id)}"]`);
    if (l) return norm(l.innerText);
  }
  const wrap = el.closest('label');
  if (wrap) return norm(wrap.innerText);
  const group = el.closest('fieldset');
  if (group && group.querySelector('legend')) return norm(group.querySelector('legend').innerText);
  return norm(el.getAttribute('aria-label') || el.getAttribute('placeholder'));
};
let n = 0;
const tag = (el) => { const t = `${prefix}-${n++}`; el.setAttribute('data-jp-field', t); return `[data-jp-field="${t}"]`; };
const out = [];
const radios = new Map();
for (const el of scope.querySelectorAll('input, textarea, select')) {
  const type = (el.getAttribute('type') || '').toLowerCase();
  if (['hidden', 'file', 'submit', 'button', 'password'].includes(type) || !visible(el)) continue;
  const required = el.required || el.getAttribute('aria-required') === 'true';
  if (type === 'radio') {
    const key = el.name || labelOf(el);
    if (!radios.has(key)) radios.set(key, { els: [], required: false });
    const r = radios.get(key);
    r.els.push(el);
    r.required = r.required || required;
    continue;
  }
  const label = labelOf(el);
  if (!label) continue;
  if (type === 'checkbox') {
    if (!el.checked) out.push({ label, selector: tag(el), kind: { kind: 'checkbox' }, required });
  } else if (el.tagName === 'SELECT') {
    if (!el.value) {
      const options = [...el.options].map((o) => norm(o.text)).filter((t) => t);
      out.push({ label, selector: tag(el), kind: { kind: 'select', options }, required });
    }
  } else if (!el.value) {
    out.push({ label, selector: tag(el), kind: { kind: 'text' }, required });
  }
}
for (const [, r] of radios) {
  if (r.els.some((el) => el.checked)) continue;
  const group = r.els[0].closest('fieldset');
  const legend = group && group.querySelector('legend');
  const label = legend ? norm(legend.innerText) : labelOf(r.els[0]);
  if (!label) continue;
  const options = r.els.map((el) => [labelOf(el), tag(el)]);
  out.push({ label, selector: options[0][1], kind: { kind: 'choice', options }, required: r.required });
}
return out;
"#;

const SELECT_JS: &str = r#"
const [el, wanted] = arguments;
const norm = (s) => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
const idx = [...el.options].findIndex((o) => norm(o.text) === norm(wanted));
if (idx < 0) return false;
el.selectedIndex = idx;
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

fn by(selector: &str) -> By {
    match selector.strip_prefix("xpath:") {
        Some(xpath) => By::XPath(xpath),
        None => By::Css(selector),
    }
}

fn session(e: WebDriverError) -> PageError {
    PageError::Session(e.to_string())
}

fn script(e: WebDriverError) -> PageError {
    PageError::Script(e.to_string())
}

/// Opens a new chromedriver session per call.
pub struct WebDriverFactory {
    server_url: String,
    headless: bool,
}

impl WebDriverFactory {
    pub fn new(server_url: impl Into<String>, headless: bool) -> Self {
        Self {
            server_url: server_url.into(),
            headless,
        }
    }

    fn capabilities(&self) -> WebDriverResult<ChromeCapabilities> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.add_arg("--headless=new")?;
        }
        caps.add_arg("--window-size=1366,768")?;
        caps.add_arg(&format!("--user-agent={USER_AGENT}"))?;
        caps.add_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_arg("--lang=en-US")?;
        caps.add_experimental_option("excludeSwitches", vec!["enable-automation"])?;
        caps.add_experimental_option(
            "prefs",
            json!({
                "download.prompt_for_download": false,
                "profile.default_content_setting_values.automatic_downloads": 1,
                "webkit.webprefs.javascript_enabled": true,
            }),
        )?;
        Ok(caps)
    }
}

#[async_trait]
impl PageFactory for WebDriverFactory {
    async fn open(&self) -> Result<Box<dyn PortalPage>, PageError> {
        let caps = self.capabilities().map_err(session)?;
        let driver = WebDriver::new(&self.server_url, caps).await.map_err(session)?;
        debug!(server = %self.server_url, headless = self.headless, "WebDriver session opened");
        Ok(Box::new(WebDriverPage {
            driver,
            tags: std::sync::atomic::AtomicU64::new(0),
        }))
    }
}

pub struct WebDriverPage {
    driver: WebDriver,
    tags: std::sync::atomic::AtomicU64,
}

impl WebDriverPage {
    fn next_tag(&self) -> String {
        let n = self.tags.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("jp{n}")
    }

    /// First displayed match, falling back to any match (hidden file inputs
    /// are still settable).
    async fn element(&self, selector: &str) -> Result<WebElement, PageError> {
        let all = self.driver.find_all(by(selector)).await.map_err(session)?;
        for el in &all {
            if el.is_displayed().await.unwrap_or(false) {
                return Ok(el.clone());
            }
        }
        all.into_iter()
            .next()
            .ok_or_else(|| PageError::NotFound(selector.to_string()))
    }

    async fn run(&self, js: &str, args: Vec<Value>) -> Result<Value, PageError> {
        let ret = self.driver.execute(js, args).await.map_err(script)?;
        Ok(ret.json().clone())
    }
}

#[async_trait]
impl PortalPage for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), PageError> {
        self.driver
            .goto(url)
            .await
            .map_err(|e| PageError::Navigation(format!("{url}: {e}")))?;
        self.run(STEALTH_JS, Vec::new()).await?;
        Ok(())
    }

    async fn wait_idle(&self) -> Result<(), PageError> {
        for _ in 0..IDLE_POLLS {
            let state = self.run("return document.readyState;", Vec::new()).await?;
            if state.as_str() == Some("complete") {
                tokio::time::sleep(SETTLE).await;
                return Ok(());
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        Err(PageError::Navigation("document never finished loading".to_string()))
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.driver.current_url().await.map_err(session)?.to_string())
    }

    async fn text(&self) -> Result<String, PageError> {
        let body = self.driver.find(By::Tag("body")).await.map_err(session)?;
        body.text().await.map_err(session)
    }

    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        let all = self.driver.find_all(by(selector)).await.map_err(session)?;
        let mut n = 0;
        for el in all {
            let file_input = el.attr("type").await.ok().flatten().as_deref() == Some("file");
            if file_input || el.is_displayed().await.unwrap_or(false) {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn is_enabled(&self, selector: &str) -> Result<bool, PageError> {
        self.element(selector).await?.is_enabled().await.map_err(session)
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let el = self.element(selector).await?;
        let _ = el.scroll_into_view().await;
        if el.click().await.is_err() {
            // Overlays intercept native clicks on some portals.
            let arg = el.to_json().map_err(script)?;
            self.run("arguments[0].click();", vec![arg]).await?;
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let el = self.element(selector).await?;
        el.clear().await.map_err(session)?;
        el.send_keys(value).await.map_err(session)
    }

    async fn value(&self, selector: &str) -> Result<String, PageError> {
        let el = self.element(selector).await?;
        Ok(el.value().await.map_err(session)?.unwrap_or_default())
    }

    async fn select(&self, selector: &str, option: &str) -> Result<(), PageError> {
        let el = self.element(selector).await?;
        let arg = el.to_json().map_err(script)?;
        let picked = self.run(SELECT_JS, vec![arg, json!(option)]).await?;
        if picked.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(PageError::NotFound(format!("option \"{option}\" in {selector}")))
        }
    }

    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        let el = self.element(selector).await?;
        el.send_keys(path.to_string_lossy().as_ref()).await.map_err(session)
    }

    async fn scroll(&self) -> Result<(), PageError> {
        self.run("window.scrollBy(0, window.innerHeight);", Vec::new())
            .await
            .map(|_| ())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        self.driver.screenshot_as_png().await.map_err(session)
    }

    async fn resolve_label(&self, label: &str, strategy: LabelStrategy) -> Result<Option<String>, PageError> {
        let strategy = match strategy {
            LabelStrategy::For => "for",
            LabelStrategy::Sibling => "sibling",
        };
        let found = self
            .run(RESOLVE_LABEL_JS, vec![json!(label), json!(strategy), json!(self.next_tag())])
            .await?;
        Ok(found.as_str().map(String::from))
    }

    async fn questions(&self, scope: &str) -> Result<Vec<Question>, PageError> {
        let found = self.run(QUESTIONS_JS, vec![json!(scope), json!(self.next_tag())]).await?;
        serde_json::from_value(found).map_err(|e| PageError::Script(format!("question scan: {e}")))
    }

    async fn close(&self) -> Result<(), PageError> {
        self.driver.clone().quit().await.map_err(session)
    }
}
