//! Per-site policies describing how to drive a chat web UI: locate the input
//! field, type with human tempo, submit, and detect that a response finished.

mod adapter;
mod registry;
mod selectors;
pub mod sites;
pub mod tempo;

pub use adapter::{
    locate_first_visible, wait_for_assistant_turn, AdapterError, SiteAdapter,
};
pub use registry::AdapterRegistry;
pub use selectors::SelectorProfile;
