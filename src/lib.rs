//! promptbridge: drive chat web UIs through real browsers over CDP.
//!
//! The crates compose bottom-up: `cdp-relay` joins a CDP client to a browser
//! extension, `browser-context` produces contexts over either a locally
//! launched browser or that relay, `site-adapters` knows how to drive each
//! chat site, and `tab-controller` owns the tabs and exposes the
//! request/response surface external callers use.

pub use browser_context::{
    BrowserContext, ContextError, ContextFactory, LaunchConfig, PersistentContextFactory,
    RelayContextFactory, RelayEndpoints,
};
pub use cdp_relay::{RelayError, RelayHandle};
pub use promptbridge_core_types::{ControllerError, TabId, TabSnapshot, WebsiteInfo};
pub use site_adapters::{AdapterRegistry, SelectorProfile, SiteAdapter};
pub use tab_controller::TabController;
