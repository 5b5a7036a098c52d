//! Context factories: opaque producers of a browser context plus a disposer.
//!
//! The controller only ever sees [`ContextFactory`] and [`BrowserContext`];
//! whether commands reach a locally launched Chromium or traverse the relay
//! into a user-owned browser is invisible to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ContextError;
use crate::launch::{launch_browser, LaunchConfig};
use crate::page::PageHandle;
use crate::transport::{CdpConnection, PageInfo};

/// Capability the controller demands: produce a context, nothing more.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create_context(&self) -> Result<BrowserContext, ContextError>;
}

enum ContextGuard {
    Local { child: Child },
    Relay { relay: cdp_relay::RelayHandle },
}

/// One live browser context: a CDP connection plus whatever resource keeps it
/// alive. [`BrowserContext::close`] is the disposer and is idempotent.
pub struct BrowserContext {
    conn: Arc<CdpConnection>,
    guard: Mutex<Option<ContextGuard>>,
}

impl BrowserContext {
    fn new(conn: Arc<CdpConnection>, guard: Option<ContextGuard>) -> Self {
        Self {
            conn,
            guard: Mutex::new(guard),
        }
    }

    /// Connect to a DevTools-compatible endpoint somebody else owns (an
    /// already-running browser, or a relay started out of band). The caller
    /// keeps responsibility for that endpoint's lifetime.
    pub async fn connect_external(ws_url: &str) -> Result<BrowserContext, ContextError> {
        let conn = Arc::new(CdpConnection::connect(ws_url).await?);
        conn.start_discovery().await?;
        Ok(BrowserContext::new(conn, None))
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Authoritative page listing; an error means the context is dead.
    pub async fn pages(&self) -> Result<Vec<PageInfo>, ContextError> {
        self.conn.list_pages().await
    }

    /// Create a fresh page and attach to it. Auto-attach usually supplies the
    /// session before the explicit attach is needed.
    pub async fn new_page(&self, url: &str) -> Result<PageHandle, ContextError> {
        let target_id = self.conn.create_target(url).await?;
        let session_id = match self
            .conn
            .wait_for_session(&target_id, Duration::from_secs(2))
            .await
        {
            Ok(session) => session,
            Err(_) => self.conn.attach(&target_id).await?,
        };
        Ok(PageHandle::new(
            Arc::clone(&self.conn),
            target_id,
            session_id,
        ))
    }

    /// Adopt a page that already exists in the context (for example one the
    /// user opened themselves).
    pub async fn adopt(&self, target_id: &str) -> Result<PageHandle, ContextError> {
        let session_id = match self
            .conn
            .target_state(target_id)
            .and_then(|state| state.session)
        {
            Some(session) => session,
            None => self.conn.attach(target_id).await?,
        };
        Ok(PageHandle::new(
            Arc::clone(&self.conn),
            target_id.to_string(),
            session_id,
        ))
    }

    /// Dispose the context: stop the connection, then release the backing
    /// resource. Safe to call more than once.
    pub async fn close(&self) {
        self.conn.close();
        let guard = self.guard.lock().await.take();
        match guard {
            Some(ContextGuard::Local { mut child }) => {
                if let Err(err) = child.kill().await {
                    warn!(target: "browser-context", %err, "failed to kill browser child");
                }
            }
            Some(ContextGuard::Relay { relay }) => {
                relay.shutdown().await;
            }
            None => {
                debug!(target: "browser-context", "context already disposed");
            }
        }
    }
}

/// Launches a local browser against a persistent user-data directory.
pub struct PersistentContextFactory {
    config: LaunchConfig,
}

impl PersistentContextFactory {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }
}

impl Default for PersistentContextFactory {
    fn default() -> Self {
        Self::new(LaunchConfig::default())
    }
}

#[async_trait]
impl ContextFactory for PersistentContextFactory {
    async fn create_context(&self) -> Result<BrowserContext, ContextError> {
        let (child, ws_url) = launch_browser(&self.config).await?;
        let conn = Arc::new(CdpConnection::connect(&ws_url).await?);
        conn.start_discovery().await?;
        info!(target: "browser-context", "persistent context ready");
        Ok(BrowserContext::new(
            conn,
            Some(ContextGuard::Local { child }),
        ))
    }
}

/// Endpoint pair of the most recently started relay, for whoever has to tell
/// the extension where to connect.
#[derive(Clone, Debug)]
pub struct RelayEndpoints {
    pub cdp_url: String,
    pub extension_url: String,
}

/// Starts a relay on a free loopback port and connects back to its `/cdp`
/// endpoint. The relay holds commands until the extension peer pairs, so
/// discovery runs in the background rather than blocking context creation.
#[derive(Default)]
pub struct RelayContextFactory {
    endpoints: parking_lot::Mutex<Option<RelayEndpoints>>,
}

impl RelayContextFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints of the relay backing the most recently created context.
    pub fn last_endpoints(&self) -> Option<RelayEndpoints> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl ContextFactory for RelayContextFactory {
    async fn create_context(&self) -> Result<BrowserContext, ContextError> {
        let relay = cdp_relay::start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .map_err(|err| ContextError::Relay(err.to_string()))?;
        info!(
            target: "browser-context",
            cdp = %relay.cdp_url(),
            extension = %relay.extension_url(),
            "relay context started"
        );
        *self.endpoints.lock() = Some(RelayEndpoints {
            cdp_url: relay.cdp_url(),
            extension_url: relay.extension_url(),
        });

        let conn = match CdpConnection::connect(&relay.cdp_url()).await {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                relay.shutdown().await;
                return Err(err);
            }
        };

        let discovery = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Err(err) = discovery.start_discovery().await {
                warn!(target: "browser-context", %err, "relay discovery failed");
            }
        });

        Ok(BrowserContext::new(conn, Some(ContextGuard::Relay { relay })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_factory_yields_a_live_context() {
        let factory = RelayContextFactory::new();
        let context = factory.create_context().await.expect("context");
        assert!(context.is_alive());
        context.close().await;
        // Disposal is idempotent.
        context.close().await;
    }
}
