use async_trait::async_trait;

use crate::adapter::SiteAdapter;
use crate::selectors::SelectorProfile;

static PROFILE: SelectorProfile = SelectorProfile {
    input_area: &[
        "rich-textarea div[contenteditable='true']",
        "div.ql-editor",
    ],
    send_button: &["button[aria-label='Send message']", "button.send-button"],
    chat_container: &["chat-window", "main"],
    last_message: &["model-response", "message-content.model-response-text"],
};

pub struct GeminiAdapter;

#[async_trait]
impl SiteAdapter for GeminiAdapter {
    fn website_id(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Gemini"
    }

    fn home_url(&self) -> &'static str {
        "https://gemini.google.com"
    }

    fn requires_proxy(&self) -> bool {
        true
    }

    fn selectors(&self) -> &SelectorProfile {
        &PROFILE
    }

    fn host_fragments(&self) -> &'static [&'static str] {
        &["gemini.google.com"]
    }
}
