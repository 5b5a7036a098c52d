use std::time::Duration;

use async_trait::async_trait;
use browser_context::PageHandle;

use crate::adapter::{wait_for_assistant_turn, AdapterError, SiteAdapter};
use crate::selectors::SelectorProfile;

static PROFILE: SelectorProfile = SelectorProfile {
    input_area: &[
        "#prompt-textarea",
        "textarea[data-testid='prompt-textarea']",
        "div[contenteditable='true']",
    ],
    send_button: &[
        "button[data-testid='send-button']",
        "button[aria-label='Send prompt']",
    ],
    chat_container: &["main", "div[role='presentation']"],
    last_message: &["div[data-message-author-role='assistant']"],
};

static STOP_INDICATOR: &[&str] = &[
    "button[data-testid='stop-button']",
    "button[aria-label='Stop generating']",
];

pub struct ChatGptAdapter;

#[async_trait]
impl SiteAdapter for ChatGptAdapter {
    fn website_id(&self) -> &'static str {
        "chatgpt"
    }

    fn display_name(&self) -> &'static str {
        "ChatGPT"
    }

    fn home_url(&self) -> &'static str {
        "https://chatgpt.com"
    }

    fn requires_proxy(&self) -> bool {
        true
    }

    fn selectors(&self) -> &SelectorProfile {
        &PROFILE
    }

    fn host_fragments(&self) -> &'static [&'static str] {
        &["chatgpt.com", "chat.openai.com"]
    }

    async fn wait_for_response(&self, page: &PageHandle) -> Result<(), AdapterError> {
        wait_for_assistant_turn(
            page,
            PROFILE.last_message,
            STOP_INDICATOR,
            Duration::from_secs(20),
            Duration::from_secs(120),
        )
        .await
    }
}
