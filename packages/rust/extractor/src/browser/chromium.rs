//! chromiumoxide-backed [`ResultPage`] and browser process lifecycle.

use std::time::Duration;

use admitsync_shared::{AdmitError, BrowserSettings, Result};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::machine::ResultPage;

/// CDP request timeout for the launched browser.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One browser process plus its CDP handler task.
///
/// Prefer [`BrowserSession::close`]. If the session is dropped instead (an
/// error path or a cancelled future) the process is killed from a spawned
/// task and the handler is aborted.
pub struct BrowserSession {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
    runtime: tokio::runtime::Handle,
}

impl BrowserSession {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let mut builder = BrowserConfig::builder().request_timeout(REQUEST_TIMEOUT);
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &settings.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| AdmitError::Browser(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AdmitError::Browser(format!("failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        debug!("browser launched");

        Ok(Self {
            browser: Some(browser),
            handler,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Open `url` in a new tab and wait for the initial navigation.
    pub async fn open(&self, url: &str) -> Result<ChromiumPage> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| AdmitError::Browser("browser already closed".into()))?;
        let page = browser
            .new_page(url)
            .await
            .map_err(|e| AdmitError::Browser(format!("{url}: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| AdmitError::Browser(format!("{url}: navigation failed: {e}")))?;
        Ok(ChromiumPage { page })
    }

    /// Close the browser and wait for the process to exit.
    pub async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed, killing process");
                if let Some(Err(e)) = browser.kill().await {
                    warn!(error = %e, "failed to kill browser after close error");
                }
            }
            if let Err(e) = browser.wait().await {
                warn!(error = %e, "waiting for browser exit failed");
            }
            debug!("browser closed");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            self.runtime.spawn(async move {
                if let Some(Err(e)) = browser.kill().await {
                    warn!(error = %e, "failed to kill dropped browser");
                }
            });
        }
        self.handler.abort();
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| AdmitError::Browser(format!("script failed: {e}")))?
            .into_value::<T>()
            .map_err(|e| AdmitError::Browser(format!("unexpected script result: {e}")))
    }
}

/// JSON-quote a value for interpolation into a script.
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

impl ResultPage for ChromiumPage {
    async fn has_element(&self, selector: &str) -> Result<bool> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn submit(&self, input_selector: &str, value: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                const form = el.form || el.closest('form');
                if (!form) return false;
                if (form.requestSubmit) form.requestSubmit(); else form.submit();
                return true;
            }})()"#,
            sel = js_str(input_selector),
            val = js_str(value),
        );
        if self.eval::<bool>(script).await? {
            Ok(())
        } else {
            Err(AdmitError::Browser(format!(
                "could not submit form via {input_selector}"
            )))
        }
    }

    async fn row_texts(&self, container_selector: &str) -> Result<Vec<String>> {
        let script = format!(
            r#"(() => {{
                const root = document.querySelector({sel});
                if (!root) return [];
                const rows = Array.from(root.querySelectorAll('tr'));
                const texts = rows.length
                    ? rows.map(r => Array.from(r.cells).map(c => c.innerText.trim()).join(' '))
                    : root.innerText.split('\n');
                return texts.map(t => t.trim()).filter(t => t.length > 0);
            }})()"#,
            sel = js_str(container_selector),
        );
        self.eval(script).await
    }

    async fn body_text(&self) -> Result<String> {
        self.eval("document.body ? document.body.innerText : ''".to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_strings_are_quoted() {
        assert_eq!(js_str("input[name='sbd']"), r#""input[name='sbd']""#);
        assert_eq!(js_str(r#"a"b"#), r#""a\"b""#);
    }
}
