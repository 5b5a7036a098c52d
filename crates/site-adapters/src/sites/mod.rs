//! Built-in site adapters.

mod chatgpt;
mod claude;
mod deepseek;
mod gemini;
mod kimi;

use std::sync::Arc;

use crate::adapter::SiteAdapter;

pub use chatgpt::ChatGptAdapter;
pub use claude::ClaudeAdapter;
pub use deepseek::DeepSeekAdapter;
pub use gemini::GeminiAdapter;
pub use kimi::KimiAdapter;

/// Every built-in adapter in registration order.
pub fn default_adapters() -> Vec<Arc<dyn SiteAdapter>> {
    vec![
        Arc::new(ChatGptAdapter),
        Arc::new(ClaudeAdapter),
        Arc::new(DeepSeekAdapter),
        Arc::new(GeminiAdapter),
        Arc::new(KimiAdapter),
    ]
}
