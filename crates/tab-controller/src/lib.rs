//! Tab controller: the request/response surface external callers drive.

pub mod challenge;
mod controller;

pub use controller::TabController;
pub use promptbridge_core_types::{ControllerError, TabId, TabSnapshot, WebsiteInfo};
