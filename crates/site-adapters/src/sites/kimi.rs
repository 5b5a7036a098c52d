use async_trait::async_trait;

use crate::adapter::SiteAdapter;
use crate::selectors::SelectorProfile;

static PROFILE: SelectorProfile = SelectorProfile {
    input_area: &["div[contenteditable='true']", "textarea"],
    send_button: &[
        "button[data-testid='msh-chatinput-send-button']",
        "button.send-button",
    ],
    chat_container: &["#app", "main"],
    last_message: &["div.segment-assistant", "div.markdown-container"],
};

pub struct KimiAdapter;

#[async_trait]
impl SiteAdapter for KimiAdapter {
    fn website_id(&self) -> &'static str {
        "kimi"
    }

    fn display_name(&self) -> &'static str {
        "Kimi"
    }

    fn home_url(&self) -> &'static str {
        "https://kimi.moonshot.cn"
    }

    fn selectors(&self) -> &SelectorProfile {
        &PROFILE
    }

    fn host_fragments(&self) -> &'static [&'static str] {
        &["kimi.moonshot.cn", "kimi.com"]
    }
}
