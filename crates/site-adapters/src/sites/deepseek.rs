use std::time::Duration;

use async_trait::async_trait;
use browser_context::PageHandle;

use crate::adapter::{wait_for_assistant_turn, AdapterError, SiteAdapter};
use crate::selectors::SelectorProfile;

static PROFILE: SelectorProfile = SelectorProfile {
    input_area: &["textarea#chat-input", "textarea"],
    send_button: &[
        "div[role='button'][aria-disabled='false']",
        "button[type='submit']",
    ],
    chat_container: &["#root", "main"],
    last_message: &["div.ds-markdown", "div.message-content"],
};

static STOP_INDICATOR: &[&str] = &["div[role='button'].stop-generating"];

pub struct DeepSeekAdapter;

#[async_trait]
impl SiteAdapter for DeepSeekAdapter {
    fn website_id(&self) -> &'static str {
        "deepseek"
    }

    fn display_name(&self) -> &'static str {
        "DeepSeek"
    }

    fn home_url(&self) -> &'static str {
        "https://chat.deepseek.com"
    }

    fn selectors(&self) -> &SelectorProfile {
        &PROFILE
    }

    fn host_fragments(&self) -> &'static [&'static str] {
        &["deepseek.com"]
    }

    async fn wait_for_response(&self, page: &PageHandle) -> Result<(), AdapterError> {
        wait_for_assistant_turn(
            page,
            PROFILE.last_message,
            STOP_INDICATOR,
            Duration::from_secs(15),
            Duration::from_secs(120),
        )
        .await
    }
}
