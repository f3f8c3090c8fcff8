use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{BrowserConfig, UserAgentSection, ViewportSection};
use crate::task::{Action, TaskPayload, TaskSpec};

use super::backend::{SessionBackend, SessionHandle};
use super::error::{SessionError, SessionResult};
use super::profile::{ProfileStore, SessionProfile};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Bounded wait applied to selector lookups when an action does not carry
/// its own timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const URL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct ViewportSpec {
    width: u32,
    height: u32,
    device_scale_factor: f64,
}

/// Launches headless Chromium sessions from the browser configuration.
pub struct ChromiumBackend {
    config: Arc<BrowserConfig>,
    profiles: ProfileStore,
}

impl ChromiumBackend {
    pub fn new(config: BrowserConfig) -> SessionResult<Self> {
        let profiles = ProfileStore::from_config(&config.profiles)?;
        Ok(Self {
            config: Arc::new(config),
            profiles,
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    fn build_chromium_config(
        &self,
        profile: &SessionProfile,
        viewport: &ViewportSpec,
        user_agent: &str,
    ) -> SessionResult<ChromiumConfig> {
        let chromium = &self.config.chromium;
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&chromium.executable_path)
            .user_data_dir(profile.path())
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if !chromium.headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let flags = &self.config.flags;
        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
        ];
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if flags.mute_audio {
            args.push("--mute-audio".into());
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(accept) = &flags.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        for extra in &flags.extra_args {
            args.push(extra.clone());
        }
        args.push("--password-store=basic".into());

        builder = builder.args(args);
        builder.build().map_err(SessionError::Configuration)
    }
}

fn select_viewport(section: &ViewportSection) -> ViewportSpec {
    let jitter = section.jitter_pixels as i32;
    if jitter == 0 {
        return ViewportSpec {
            width: section.width,
            height: section.height,
            device_scale_factor: section.device_scale_factor,
        };
    }
    let mut rng = rand::thread_rng();
    let width = (section.width as i32 + rng.gen_range(-jitter..=jitter)).clamp(640, 2560) as u32;
    let height = (section.height as i32 + rng.gen_range(-jitter..=jitter)).clamp(480, 1600) as u32;
    ViewportSpec {
        width,
        height,
        device_scale_factor: section.device_scale_factor,
    }
}

fn select_user_agent(section: &UserAgentSection) -> String {
    if section.pool.is_empty() {
        return DEFAULT_USER_AGENT.to_string();
    }
    let mut rng = rand::thread_rng();
    let index = rng.gen_range(0..section.pool.len());
    section.pool[index].clone()
}

#[async_trait]
impl SessionBackend for ChromiumBackend {
    async fn launch(&self) -> SessionResult<Box<dyn SessionHandle>> {
        self.profiles.cleanup_expired()?;
        let profile = self.profiles.allocate()?;
        let viewport = select_viewport(&self.config.viewport);
        let user_agent = select_user_agent(&self.config.user_agents);
        let chromium_config = self.build_chromium_config(&profile, &viewport, &user_agent)?;

        info!(
            profile = %profile.id(),
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            headless = self.config.chromium.headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;

        let handler_profile = profile.id().to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(profile = %handler_profile, error = %err, "chromium handler reported error");
                }
            }
            // The stream ends when the CDP connection closes.
            debug!(profile = %handler_profile, "chromium event loop terminated");
        });

        Ok(Box::new(ChromiumSession {
            browser: Some(browser),
            handler_task: Some(handler_task),
            page: None,
            profile,
            user_agent,
            config: Arc::clone(&self.config),
        }))
    }
}

/// One live Chromium process plus the page it drives. Pages persist across
/// tasks on the same session; each task starts with its own navigation.
pub struct ChromiumSession {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    profile: SessionProfile,
    user_agent: String,
    config: Arc<BrowserConfig>,
}

impl ChromiumSession {
    fn connection_lost(&self) -> bool {
        match &self.handler_task {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Wrap a CDP failure: a dead event loop means the process or its
    /// connection is gone, anything else is an action-level failure on a
    /// still-usable browser.
    fn classify(&self, action: &'static str, message: String) -> SessionError {
        if self.connection_lost() {
            SessionError::Protocol(format!("{action}: {message}"))
        } else {
            SessionError::Action { action, message }
        }
    }

    async fn page(&mut self) -> SessionResult<Page> {
        if let Some(page) = &self.page {
            return Ok(page.clone());
        }
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("session already closed".to_string()))?;
        let params = CreateTargetParams::new("about:blank");
        let page = browser
            .new_page(params)
            .await
            .map_err(|err| self.classify("new_page", err.to_string()))?;

        let ua_params = {
            let mut builder = SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
            if let Some(accept) = &self.config.flags.accept_language {
                builder = builder.accept_language(accept.clone());
            }
            builder.build().map_err(SessionError::Configuration)?
        };
        page.set_user_agent(ua_params)
            .await
            .map_err(|err| self.classify("set_user_agent", err.to_string()))?;

        self.page = Some(page.clone());
        Ok(page)
    }

    async fn goto(&self, page: &Page, url: &str) -> SessionResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Configuration)?;
        page.goto(params)
            .await
            .map_err(|err| self.classify("goto", err.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|err| self.classify("goto", err.to_string()))?;
        Ok(())
    }

    async fn current_url(&self, page: &Page) -> SessionResult<Option<String>> {
        page.url()
            .await
            .map_err(|err| self.classify("current_url", err.to_string()))
    }

    /// Try each selector in order until one resolves, polling until the
    /// bounded wait elapses.
    async fn wait_for_any(
        &self,
        page: &Page,
        selectors: &[String],
        wait: Duration,
    ) -> SessionResult<Element> {
        let deadline = Instant::now() + wait;
        loop {
            for selector in selectors {
                if let Ok(element) = page.find_element(selector.as_str()).await {
                    return Ok(element);
                }
            }
            if self.connection_lost() {
                return Err(SessionError::Protocol(format!(
                    "wait_for_selector: connection lost while waiting for {}",
                    selectors.join(", ")
                )));
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout(format!(
                    "selector {}",
                    selectors.join(", ")
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn press_key(&self, page: &Page, key: &str) -> SessionResult<()> {
        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key)
            .build()
            .map_err(SessionError::Configuration)?;
        page.execute(key_down)
            .await
            .map_err(|err| self.classify("press_key", err.to_string()))?;
        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .build()
            .map_err(SessionError::Configuration)?;
        page.execute(key_up)
            .await
            .map_err(|err| self.classify("press_key", err.to_string()))?;
        Ok(())
    }

    async fn wait_for_url(
        &self,
        page: &Page,
        fragment: &str,
        wait: Duration,
    ) -> SessionResult<String> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(url) = self.current_url(page).await? {
                if url.contains(fragment) {
                    return Ok(url);
                }
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout(format!("url containing {fragment}")));
            }
            sleep(URL_POLL_INTERVAL).await;
        }
    }

    async fn apply(
        &self,
        page: &Page,
        action: &Action,
        payload: &mut TaskPayload,
    ) -> SessionResult<()> {
        match action {
            Action::Goto { url } => self.goto(page, url).await,
            Action::WaitForSelector {
                selectors,
                timeout_ms,
            } => {
                let wait = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT);
                self.wait_for_any(page, selectors, wait).await.map(|_| ())
            }
            Action::Fill { selectors, value } => {
                let element = self.wait_for_any(page, selectors, DEFAULT_WAIT).await?;
                element
                    .click()
                    .await
                    .map_err(|err| self.classify("fill", err.to_string()))?;
                element
                    .type_str(value)
                    .await
                    .map_err(|err| self.classify("fill", err.to_string()))?;
                Ok(())
            }
            Action::Click { selectors } => {
                let element = self.wait_for_any(page, selectors, DEFAULT_WAIT).await?;
                element
                    .click()
                    .await
                    .map_err(|err| self.classify("click", err.to_string()))?;
                Ok(())
            }
            Action::PressKey { key } => self.press_key(page, key).await,
            Action::Sleep { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Action::WaitForUrl {
                contains,
                timeout_ms,
            } => {
                let wait = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT);
                self.wait_for_url(page, contains, wait).await.map(|_| ())
            }
            Action::ExtractText { selector, into } => {
                let element = self
                    .wait_for_any(page, std::slice::from_ref(selector), DEFAULT_WAIT)
                    .await?;
                let text = element
                    .inner_text()
                    .await
                    .map_err(|err| self.classify("extract_text", err.to_string()))?
                    .unwrap_or_default();
                payload.insert(into.clone(), serde_json::Value::String(text));
                Ok(())
            }
            Action::ExtractAttribute {
                selector,
                attribute,
                into,
            } => {
                let element = self
                    .wait_for_any(page, std::slice::from_ref(selector), DEFAULT_WAIT)
                    .await?;
                let value = element
                    .attribute(attribute)
                    .await
                    .map_err(|err| self.classify("extract_attribute", err.to_string()))?;
                payload.insert(
                    into.clone(),
                    value.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
                );
                Ok(())
            }
            Action::ExtractUrlParam { param, into } => {
                let current = self.current_url(page).await?.ok_or_else(|| SessionError::Action {
                    action: "extract_url_param",
                    message: "page has no URL".to_string(),
                })?;
                let parsed = url::Url::parse(&current).map_err(|err| SessionError::Action {
                    action: "extract_url_param",
                    message: format!("unparseable URL {current}: {err}"),
                })?;
                let value = parsed
                    .query_pairs()
                    .find(|(name, _)| name == param)
                    .map(|(_, value)| value.into_owned())
                    .ok_or_else(|| SessionError::Action {
                        action: "extract_url_param",
                        message: format!("parameter {param} not present in {current}"),
                    })?;
                payload.insert(into.clone(), serde_json::Value::String(value));
                Ok(())
            }
            Action::Evaluate { script, into } => {
                let result = page
                    .evaluate(script.as_str())
                    .await
                    .map_err(|err| self.classify("evaluate", err.to_string()))?;
                if let Some(slot) = into {
                    let value = result.value().cloned().unwrap_or(serde_json::Value::Null);
                    payload.insert(slot.clone(), value);
                }
                Ok(())
            }
            Action::Screenshot { into } => {
                let params = ScreenshotParams::builder().build();
                let bytes = page
                    .screenshot(params)
                    .await
                    .map_err(|err| self.classify("screenshot", err.to_string()))?;
                payload.insert(into.clone(), serde_json::Value::String(BASE64.encode(bytes)));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SessionHandle for ChromiumSession {
    async fn run(&mut self, spec: &TaskSpec) -> SessionResult<TaskPayload> {
        if self.connection_lost() {
            return Err(SessionError::Protocol(
                "chromium event loop terminated".to_string(),
            ));
        }
        let page = self.page().await?;
        self.goto(&page, &spec.start_url).await?;

        let mut payload = TaskPayload::default();
        for action in &spec.actions {
            debug!(profile = %self.profile.id(), action = action.label(), "applying action");
            self.apply(&page, action, &mut payload).await?;
        }
        payload.final_url = self.current_url(&page).await.unwrap_or(None);
        Ok(payload)
    }

    async fn close(&mut self) -> SessionResult<()> {
        if let Some(mut browser) = self.browser.take() {
            info!(profile = %self.profile.id(), "shutting down chromium instance");
            if let Err(err) = browser.close().await {
                warn!(profile = %self.profile.id(), error = %err, "failed to close browser gracefully");
            }
            if let Some(handle) = self.handler_task.take() {
                handle.abort();
            }
            self.page = None;
            self.profile.remove();
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!(
                profile = %self.profile.id(),
                "chromium session dropped without explicit close"
            );
            if let Some(handle) = self.handler_task.take() {
                handle.abort();
            }
        }
    }
}
