//! The site-adapter contract and the default typing/submit sequence.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use browser_context::{ContextError, ElementPoint, PageHandle};
use promptbridge_core_types::WebsiteInfo;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::selectors::SelectorProfile;
use crate::tempo;

const DOM_READY_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_RESPONSE_WAIT: Duration = Duration::from_secs(2);
const SELECTOR_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no visible input area matched the selector profile")]
    InputNotFound,
    #[error(transparent)]
    Page(#[from] ContextError),
}

/// Policy for driving one chat site. Adapters are stateless value objects;
/// the page is the only shared resource they touch.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn website_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn home_url(&self) -> &'static str;
    fn requires_proxy(&self) -> bool {
        false
    }
    fn selectors(&self) -> &SelectorProfile;

    /// Hostname fragments this adapter claims, matched case-insensitively
    /// against the URL's host.
    fn host_fragments(&self) -> &'static [&'static str];

    fn matches_url(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self
                .host_fragments()
                .iter()
                .any(|fragment| host.contains(fragment)),
            None => false,
        }
    }

    fn info(&self) -> WebsiteInfo {
        WebsiteInfo {
            website_id: self.website_id().to_string(),
            display_name: self.display_name().to_string(),
            home_url: self.home_url().to_string(),
            requires_proxy: self.requires_proxy(),
        }
    }

    /// Whether the page shell has rendered enough to interact with.
    async fn is_page_ready(&self, page: &PageHandle) -> bool {
        if page.wait_dom_ready(DOM_READY_WAIT).await.is_err() {
            return false;
        }
        match self.selectors().root() {
            Some(root) => page.query_visible(root).await.ok().flatten().is_some(),
            None => true,
        }
    }

    /// Type the prompt like a person would and submit it, then wait for the
    /// site to finish responding. Only a missing input area is fatal.
    async fn execute_prompt(&self, page: &PageHandle, prompt: &str) -> Result<(), AdapterError> {
        if let Err(err) = page.wait_dom_ready(DOM_READY_WAIT).await {
            recover_timeout(err, "dom ready")?;
        }
        sleep(tempo::think_delay()).await;

        let (selector, point) = locate_first_visible(page, self.selectors().input_area)
            .await?
            .ok_or(AdapterError::InputNotFound)?;
        debug!(
            target: "site-adapters",
            site = self.website_id(),
            selector,
            "input located"
        );

        page.hover(point).await?;
        sleep(tempo::micro_delay()).await;
        page.click(point).await?;
        if let Err(err) = page.focus(selector).await {
            debug!(target: "site-adapters", %err, "focus fallback failed");
        }
        page.clear_selection().await?;

        for step in tempo::typing_plan(prompt) {
            sleep(step.delay).await;
            page.insert_text(&step.chunk).await?;
        }

        sleep(tempo::pre_send_delay()).await;

        match locate_first_visible(page, self.selectors().send_button).await? {
            Some((send_selector, send_point)) => {
                debug!(
                    target: "site-adapters",
                    site = self.website_id(),
                    selector = send_selector,
                    "clicking send"
                );
                page.hover(send_point).await?;
                sleep(tempo::micro_delay()).await;
                page.click(send_point).await?;
            }
            None => {
                debug!(target: "site-adapters", site = self.website_id(), "no send button; pressing Enter");
                page.press_enter().await?;
            }
        }

        self.wait_for_response(page).await
    }

    /// Wait until the site appears done responding. The default is a fixed
    /// settle; sites with reliable markers override this with
    /// [`wait_for_assistant_turn`].
    async fn wait_for_response(&self, page: &PageHandle) -> Result<(), AdapterError> {
        let _ = page;
        sleep(DEFAULT_RESPONSE_WAIT).await;
        Ok(())
    }
}

/// Walk an ordered candidate list and return the first visible and enabled
/// match together with the selector that found it.
pub async fn locate_first_visible(
    page: &PageHandle,
    candidates: &'static [&'static str],
) -> Result<Option<(&'static str, ElementPoint)>, AdapterError> {
    for selector in candidates {
        if let Some(point) = page.query_visible(selector).await? {
            return Ok(Some((selector, point)));
        }
    }
    Ok(None)
}

/// Shared override body: wait for an assistant-authored element to appear,
/// then for the stop/typing indicator to go away. Both waits expire silently.
pub async fn wait_for_assistant_turn(
    page: &PageHandle,
    assistant: &'static [&'static str],
    stop_indicator: &'static [&'static str],
    appear_within: Duration,
    settle_within: Duration,
) -> Result<(), AdapterError> {
    let appear_limit = Instant::now() + appear_within;
    'appear: loop {
        for selector in assistant {
            match page.query_visible(selector).await {
                Ok(Some(_)) => break 'appear,
                Ok(None) => {}
                Err(err) => {
                    recover_timeout(err, "assistant marker")?;
                }
            }
        }
        if Instant::now() >= appear_limit {
            debug!(target: "site-adapters", "assistant marker never appeared; continuing");
            break;
        }
        sleep(SELECTOR_POLL).await;
    }

    let settle_limit = Instant::now() + settle_within;
    loop {
        let mut busy = false;
        for selector in stop_indicator {
            match page.query_visible(selector).await {
                Ok(Some(_)) => {
                    busy = true;
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    recover_timeout(err, "stop indicator")?;
                }
            }
        }
        if !busy {
            return Ok(());
        }
        if Instant::now() >= settle_limit {
            debug!(target: "site-adapters", "stop indicator still present at deadline; continuing");
            return Ok(());
        }
        sleep(SELECTOR_POLL).await;
    }
}

/// Best-effort waits recover timeouts locally and propagate everything else.
fn recover_timeout(err: ContextError, what: &str) -> Result<(), AdapterError> {
    match err {
        ContextError::CommandTimeout(_) => {
            debug!(target: "site-adapters", what, "best-effort wait expired");
            Ok(())
        }
        other => Err(other.into()),
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest
        .split(['/', '?', '#'])
        .next()?
        .split('@')
        .last()?
        .split(':')
        .next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_handles_paths_and_ports() {
        assert_eq!(
            host_of("https://chat.deepseek.com/x").as_deref(),
            Some("chat.deepseek.com")
        );
        assert_eq!(
            host_of("http://localhost:9222/json").as_deref(),
            Some("localhost")
        );
        assert_eq!(host_of("chat.openai.com").as_deref(), Some("chat.openai.com"));
        assert_eq!(host_of("https://"), None);
    }

    #[test]
    fn host_extraction_ignores_query_and_fragment() {
        assert_eq!(
            host_of("https://gemini.google.com?q=1#top").as_deref(),
            Some("gemini.google.com")
        );
    }
}
