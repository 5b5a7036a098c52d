//! Ordered selector candidates per interaction role.

/// Per-site ordered lists of candidate selectors. Order expresses
/// preference; the first visible and enabled match wins.
#[derive(Clone, Copy, Debug)]
pub struct SelectorProfile {
    pub input_area: &'static [&'static str],
    pub send_button: &'static [&'static str],
    pub chat_container: &'static [&'static str],
    pub last_message: &'static [&'static str],
}

impl SelectorProfile {
    /// Root selector used to decide a page finished rendering its shell.
    pub fn root(&self) -> Option<&'static str> {
        self.chat_container.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: SelectorProfile = SelectorProfile {
        input_area: &["#first", "#second"],
        send_button: &["button.send"],
        chat_container: &["main.chat"],
        last_message: &["div.msg:last-child"],
    };

    #[test]
    fn candidate_order_is_preserved() {
        assert_eq!(PROFILE.input_area[0], "#first");
        assert_eq!(PROFILE.input_area[1], "#second");
    }

    #[test]
    fn root_is_first_container_candidate() {
        assert_eq!(PROFILE.root(), Some("main.chat"));
    }
}
