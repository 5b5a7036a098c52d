use std::time::Duration;

use async_trait::async_trait;
use browser_context::PageHandle;

use crate::adapter::{wait_for_assistant_turn, AdapterError, SiteAdapter};
use crate::selectors::SelectorProfile;

static PROFILE: SelectorProfile = SelectorProfile {
    input_area: &[
        "div.ProseMirror[contenteditable='true']",
        "div[contenteditable='true']",
    ],
    send_button: &[
        "button[aria-label='Send Message']",
        "button[aria-label='Send message']",
    ],
    chat_container: &["div.flex-1", "main"],
    last_message: &["div[data-is-streaming]"],
};

static STOP_INDICATOR: &[&str] = &[
    "div[data-is-streaming='true']",
    "button[aria-label='Stop Response']",
];

pub struct ClaudeAdapter;

#[async_trait]
impl SiteAdapter for ClaudeAdapter {
    fn website_id(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude"
    }

    fn home_url(&self) -> &'static str {
        "https://claude.ai"
    }

    fn requires_proxy(&self) -> bool {
        true
    }

    fn selectors(&self) -> &SelectorProfile {
        &PROFILE
    }

    fn host_fragments(&self) -> &'static [&'static str] {
        &["claude.ai"]
    }

    async fn wait_for_response(&self, page: &PageHandle) -> Result<(), AdapterError> {
        wait_for_assistant_turn(
            page,
            PROFILE.last_message,
            STOP_INDICATOR,
            Duration::from_secs(20),
            Duration::from_secs(180),
        )
        .await
    }
}
