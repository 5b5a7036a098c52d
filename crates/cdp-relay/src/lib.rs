//! WebSocket relay that joins a back-end speaking the Chrome DevTools
//! Protocol to a companion browser extension executing those commands inside
//! a user-owned tab.
//!
//! One server, two paths on the same origin: `/cdp` accepts the CDP client,
//! `/extension` accepts the extension peer. Traffic is forwarded both ways
//! with a small interception table answered locally and an auto-attach
//! notification synthesized from the extension's `attachToTab` reply.

pub mod protocol;
mod relay;
mod server;

use thiserror::Error;

pub use protocol::{CdpFrame, ErrorShape, TargetAttachment};
pub use relay::RelayState;
pub use server::{start, RelayHandle};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(#[source] std::io::Error),
}
