//! The tab controller: a façade owning one browser context and the table of
//! live tabs, reconciling intended state against pages the user or the
//! browser can close out from under it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use browser_context::{BrowserContext, ContextError, ContextFactory, PageHandle};
use chrono::{DateTime, Utc};
use promptbridge_core_types::{ControllerError, TabId, TabSnapshot, WebsiteInfo};
use site_adapters::AdapterRegistry;
use tracing::{debug, info, warn};

use crate::challenge;

/// Mirrors interactive use: short ordinary waits, a long navigation window.
const NAV_TIMEOUT: Duration = Duration::from_secs(60);
const ROOT_SELECTOR_WAIT: Duration = Duration::from_secs(10);
const DOM_READY_WAIT: Duration = Duration::from_secs(5);
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_millis(1_500);
const CHALLENGE_WAIT: Duration = Duration::from_secs(30);

struct Tab {
    id: TabId,
    page: PageHandle,
    url: String,
    title: String,
    site_id: Option<String>,
    opened_at: DateTime<Utc>,
}

impl Tab {
    fn snapshot(&self) -> TabSnapshot {
        TabSnapshot {
            id: self.id,
            url: self.url.clone(),
            title: self.title.clone(),
            site_id: self.site_id.clone(),
        }
    }
}

struct ControllerInner {
    context: Option<Arc<BrowserContext>>,
    tabs: HashMap<TabId, Tab>,
    current: Option<TabId>,
}

/// Public contract for external dispatchers. All operations may be called
/// concurrently; reconciliation runs under one async mutex whose critical
/// section covers both the liveness probe and any adoption, so two callers
/// can never claim the same real page twice.
pub struct TabController {
    factory: Arc<dyn ContextFactory>,
    registry: Arc<AdapterRegistry>,
    inner: tokio::sync::Mutex<ControllerInner>,
}

impl TabController {
    pub fn new(factory: Arc<dyn ContextFactory>, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            factory,
            registry,
            inner: tokio::sync::Mutex::new(ControllerInner {
                context: None,
                tabs: HashMap::new(),
                current: None,
            }),
        }
    }

    /// Open a page on `url`. On success the page has reached at least the
    /// DOM-ready state and the tab is in the table.
    pub async fn open_tab(&self, url: &str) -> Result<TabId, ControllerError> {
        let context = {
            let mut inner = self.inner.lock().await;
            self.ensure_context(&mut inner).await?
        };

        let page = match context.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) if err.is_context_closed() => {
                let context = {
                    let mut inner = self.inner.lock().await;
                    inner.context = None;
                    inner.tabs.clear();
                    inner.current = None;
                    self.ensure_context(&mut inner).await?
                };
                context
                    .new_page("about:blank")
                    .await
                    .map_err(|err| ControllerError::BrowserUnavailable(err.to_string()))?
            }
            Err(err) => return Err(ControllerError::BrowserUnavailable(err.to_string())),
        };

        match page.navigate(url).await {
            Ok(()) => {}
            // A navigation that is merely slow is tolerated like every other
            // wait below; only the goto itself failing is fatal.
            Err(ContextError::CommandTimeout(_)) => {
                debug!(target: "tab-controller", url, "navigation reply still pending at deadline; continuing");
            }
            Err(err) => {
                let _ = page.close().await;
                return Err(ControllerError::NavigationFailed(err.to_string()));
            }
        }

        // Everything past the navigation itself is best-effort.
        if let Err(err) = page.wait_dom_ready(DOM_READY_WAIT).await {
            debug!(target: "tab-controller", %err, "dom-ready wait expired");
        }
        if let Err(err) = page.wait_network_idle(NETWORK_IDLE_WINDOW, NAV_TIMEOUT).await {
            debug!(target: "tab-controller", %err, "network-idle wait expired");
        }

        let adapter = self.registry.get_by_url(url);
        if let Some(root) = adapter
            .as_deref()
            .and_then(|adapter| adapter.selectors().root())
        {
            if let Err(err) = page.wait_for_selector(root, ROOT_SELECTOR_WAIT).await {
                debug!(target: "tab-controller", %err, "root selector wait expired");
            }
        }
        tokio::time::sleep(SETTLE_DELAY).await;
        challenge::wait_while_challenged(&page, CHALLENGE_WAIT).await;

        let observed_url = page.url().await;
        let title = page.title().await;
        let site_id = adapter
            .as_deref()
            .map(|adapter| adapter.website_id().to_string());

        let tab = Tab {
            id: TabId::new(),
            page,
            url: if observed_url.is_empty() {
                url.to_string()
            } else {
                observed_url
            },
            title,
            site_id,
            opened_at: Utc::now(),
        };
        let id = tab.id;

        let mut inner = self.inner.lock().await;
        info!(target: "tab-controller", tab = %id, url, "tab opened");
        inner.tabs.insert(id, tab);
        inner.current = Some(id);
        Ok(id)
    }

    /// Close a tab. Closing a page that already went away is not an error.
    pub async fn close_tab(&self, tab_id: TabId) -> Result<(), ControllerError> {
        let page = {
            let mut inner = self.inner.lock().await;
            self.reconcile(&mut inner).await?;
            match inner.tabs.remove(&tab_id) {
                Some(tab) => {
                    if inner.current == Some(tab_id) {
                        inner.current = None;
                    }
                    tab.page
                }
                None => return Err(ControllerError::TabNotFound(tab_id)),
            }
        };
        if let Err(err) = page.close().await {
            debug!(target: "tab-controller", %err, tab = %tab_id, "close reported an error; page treated as gone");
        }
        info!(target: "tab-controller", tab = %tab_id, "tab closed");
        Ok(())
    }

    /// Run a site adapter's typing-and-submit sequence against a tab.
    pub async fn execute_prompt(
        &self,
        tab_id: TabId,
        site_id: &str,
        prompt: &str,
    ) -> Result<(), ControllerError> {
        let (page, url) = {
            let mut inner = self.inner.lock().await;
            self.reconcile(&mut inner).await?;
            let tab = inner
                .tabs
                .get(&tab_id)
                .ok_or(ControllerError::TabNotFound(tab_id))?;
            (tab.page.clone(), tab.url.clone())
        };

        if page.is_closed() {
            self.prune(tab_id).await;
            return Err(ControllerError::TabClosed(tab_id));
        }

        // Explicit site id first, then URL-based detection.
        let adapter = match self.registry.get_by_id(site_id) {
            Some(adapter) => adapter,
            None => {
                let live_url = {
                    let observed = page.url().await;
                    if observed.is_empty() { url.clone() } else { observed }
                };
                self.registry.get_by_url(&live_url).ok_or_else(|| {
                    ControllerError::AdapterMissing {
                        site_id: site_id.to_string(),
                        url: live_url,
                    }
                })?
            }
        };

        debug!(
            target: "tab-controller",
            tab = %tab_id,
            site = adapter.website_id(),
            "executing prompt"
        );
        if let Err(err) = adapter.execute_prompt(&page, prompt).await {
            if page.is_closed() {
                self.prune(tab_id).await;
                return Err(ControllerError::TabClosed(tab_id));
            }
            return Err(ControllerError::AdapterFailure(err.to_string()));
        }

        self.refresh_tab(tab_id, &page).await;
        Ok(())
    }

    /// Full serialized HTML of the page at call time.
    pub async fn page_content(&self, tab_id: TabId) -> Result<String, ControllerError> {
        let page = {
            let mut inner = self.inner.lock().await;
            self.reconcile(&mut inner).await?;
            inner
                .tabs
                .get(&tab_id)
                .map(|tab| tab.page.clone())
                .ok_or(ControllerError::TabNotFound(tab_id))?
        };
        if page.is_closed() {
            self.prune(tab_id).await;
            return Err(ControllerError::TabClosed(tab_id));
        }
        match page.content().await {
            Ok(content) => Ok(content),
            Err(err) => {
                if page.is_closed() {
                    self.prune(tab_id).await;
                    Err(ControllerError::TabClosed(tab_id))
                } else {
                    Err(ControllerError::BrowserUnavailable(err.to_string()))
                }
            }
        }
    }

    /// Snapshot of the tab table with stale pages pruned.
    pub async fn tabs(&self) -> Vec<TabSnapshot> {
        let mut inner = self.inner.lock().await;
        if let Some(context) = inner.context.clone() {
            match context.pages().await {
                Ok(pages) => {
                    let live: HashSet<String> =
                        pages.into_iter().map(|page| page.target_id).collect();
                    prune_dead_tabs(&mut inner, &live);
                }
                Err(err) => {
                    warn!(target: "tab-controller", %err, "context probe failed; dropping state");
                    inner.context = None;
                    inner.tabs.clear();
                    inner.current = None;
                }
            }
        }
        let mut snapshots: Vec<TabSnapshot> =
            inner.tabs.values().map(Tab::snapshot).collect();
        snapshots.sort_by_key(|snapshot| snapshot.id.0);
        snapshots
    }

    /// Immutable list of registered sites.
    pub fn supported_websites(&self) -> Vec<WebsiteInfo> {
        self.registry.websites()
    }

    /// Close every page and dispose the context. Idempotent.
    pub async fn shutdown(&self) {
        let (tabs, context) = {
            let mut inner = self.inner.lock().await;
            let tabs: Vec<Tab> = inner.tabs.drain().map(|(_, tab)| tab).collect();
            inner.current = None;
            (tabs, inner.context.take())
        };
        for tab in tabs {
            if let Err(err) = tab.page.close().await {
                debug!(target: "tab-controller", %err, tab = %tab.id, "page close during shutdown failed");
            }
        }
        if let Some(context) = context {
            context.close().await;
        }
        info!(target: "tab-controller", "controller shut down");
    }

    // ---- reconciliation ----------------------------------------------------

    /// Initialize the context if needed and verify it answers. One re-init is
    /// attempted when the probe finds a dead context; a second failure fails
    /// the operation and leaves the slot empty so the next caller retries.
    async fn ensure_context(
        &self,
        inner: &mut ControllerInner,
    ) -> Result<Arc<BrowserContext>, ControllerError> {
        let mut attempts = 0;
        loop {
            if inner.context.is_none() {
                match self.factory.create_context().await {
                    Ok(context) => {
                        inner.context = Some(Arc::new(context));
                    }
                    Err(err) => {
                        return Err(ControllerError::BrowserUnavailable(err.to_string()));
                    }
                }
            }
            let context = match inner.context.clone() {
                Some(context) => context,
                None => continue,
            };
            match context.pages().await {
                Ok(_) => return Ok(context),
                Err(err) => {
                    attempts += 1;
                    warn!(target: "tab-controller", %err, attempts, "context probe failed");
                    inner.context = None;
                    inner.tabs.clear();
                    inner.current = None;
                    if attempts >= 2 {
                        return Err(ControllerError::BrowserUnavailable(err.to_string()));
                    }
                }
            }
        }
    }

    /// The `ensure_tab` pass: make sure a usable current tab exists, pruning
    /// and adopting along the way. Runs entirely under the inner lock.
    async fn reconcile(&self, inner: &mut ControllerInner) -> Result<TabId, ControllerError> {
        let mut attempts = 0;
        loop {
            let context = self.ensure_context(inner).await?;
            let pages = match context.pages().await {
                Ok(pages) => pages,
                Err(err) => {
                    attempts += 1;
                    inner.context = None;
                    inner.tabs.clear();
                    inner.current = None;
                    if attempts >= 2 {
                        return Err(ControllerError::BrowserUnavailable(err.to_string()));
                    }
                    continue;
                }
            };
            let live: HashSet<String> = pages.iter().map(|page| page.target_id.clone()).collect();

            // Current tab still good?
            if let Some(current) = inner.current {
                if let Some(tab) = inner.tabs.get(&current) {
                    if live.contains(tab.page.target_id()) && !tab.page.is_closed() {
                        return Ok(current);
                    }
                }
            }

            // Prune dead entries; promote the oldest survivor.
            prune_dead_tabs(inner, &live);
            if let Some(id) = inner
                .tabs
                .values()
                .min_by_key(|tab| tab.opened_at)
                .map(|tab| tab.id)
            {
                inner.current = Some(id);
                return Ok(id);
            }

            // Adopt a real page the table does not know about.
            let known: HashSet<String> = inner
                .tabs
                .values()
                .map(|tab| tab.page.target_id().to_string())
                .collect();
            if let Some(info) = pages.iter().find(|info| !known.contains(&info.target_id)) {
                match context.adopt(&info.target_id).await {
                    Ok(page) => {
                        let tab = Tab {
                            id: TabId::new(),
                            url: info.url.clone(),
                            title: info.title.clone(),
                            site_id: self
                                .registry
                                .get_by_url(&info.url)
                                .map(|adapter| adapter.website_id().to_string()),
                            page,
                            opened_at: Utc::now(),
                        };
                        let id = tab.id;
                        debug!(target: "tab-controller", tab = %id, url = %tab.url, "adopted existing page");
                        inner.tabs.insert(id, tab);
                        inner.current = Some(id);
                        return Ok(id);
                    }
                    Err(err) if err.is_context_closed() => {
                        attempts += 1;
                        inner.context = None;
                        inner.tabs.clear();
                        inner.current = None;
                        if attempts >= 2 {
                            return Err(ControllerError::BrowserUnavailable(err.to_string()));
                        }
                        continue;
                    }
                    Err(err) => {
                        warn!(target: "tab-controller", %err, target_id = %info.target_id, "adoption failed");
                    }
                }
            }

            // Nothing to adopt: create a fresh page.
            match context.new_page("about:blank").await {
                Ok(page) => {
                    let tab = Tab {
                        id: TabId::new(),
                        url: "about:blank".to_string(),
                        title: String::new(),
                        site_id: None,
                        page,
                        opened_at: Utc::now(),
                    };
                    let id = tab.id;
                    inner.tabs.insert(id, tab);
                    inner.current = Some(id);
                    return Ok(id);
                }
                Err(err) if err.is_context_closed() => {
                    attempts += 1;
                    inner.context = None;
                    inner.tabs.clear();
                    inner.current = None;
                    if attempts >= 2 {
                        return Err(ControllerError::BrowserUnavailable(err.to_string()));
                    }
                }
                Err(err) => return Err(ControllerError::BrowserUnavailable(err.to_string())),
            }
        }
    }

    async fn prune(&self, tab_id: TabId) {
        let mut inner = self.inner.lock().await;
        if inner.tabs.remove(&tab_id).is_some() {
            debug!(target: "tab-controller", tab = %tab_id, "pruned closed tab");
        }
        if inner.current == Some(tab_id) {
            inner.current = None;
        }
    }

    /// Refresh last-observed URL and title after an operation touched a page.
    async fn refresh_tab(&self, tab_id: TabId, page: &PageHandle) {
        let url = page.url().await;
        let title = page.title().await;
        let mut inner = self.inner.lock().await;
        if let Some(tab) = inner.tabs.get_mut(&tab_id) {
            if !url.is_empty() {
                tab.url = url;
            }
            if !title.is_empty() {
                tab.title = title;
            }
        }
    }
}

fn prune_dead_tabs(inner: &mut ControllerInner, live: &HashSet<String>) {
    let before = inner.tabs.len();
    inner
        .tabs
        .retain(|_, tab| live.contains(tab.page.target_id()) && !tab.page.is_closed());
    if inner.tabs.len() != before {
        debug!(
            target: "tab-controller",
            pruned = before - inner.tabs.len(),
            "removed tabs whose pages closed"
        );
    }
    if let Some(current) = inner.current {
        if !inner.tabs.contains_key(&current) {
            inner.current = None;
        }
    }
}
