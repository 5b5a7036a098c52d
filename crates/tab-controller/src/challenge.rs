//! Challenge and block-page detection, plus the bounded wait that goes with
//! it.
//!
//! Chat sites hide bot checks behind many skins, so no single marker is
//! trusted on its own: the detector accumulates weighted evidence from the
//! URL, the title, and the visible text, and only a combined score past the
//! threshold counts as a challenge. The bridge never solves one; it polls
//! until the user clears it or the wait runs out.

use std::time::{Duration, Instant};

use browser_context::PageHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Evidence needed before a page counts as challenged.
const SCORE_THRESHOLD: u32 = 3;
const CONCLUSIVE: u32 = 3;
const CORROBORATING: u32 = 1;

/// URL fragments left by hosted challenge flows.
const URL_MARKERS: &[&str] = &[
    "__cf_chl",
    "cdn-cgi/challenge",
    "/challenge",
    "geetest",
    "hcaptcha",
    "recaptcha",
];

/// Interstitial titles that are conclusive by themselves.
const TITLE_MARKERS: &[&str] = &[
    "just a moment",
    "attention required",
    "security check",
    "access denied",
    "安全验证",
];

/// Body phrases that are conclusive by themselves.
const DECISIVE_PHRASES: &[&str] = &[
    "verify you are human",
    "verify you're a human",
    "complete the security check",
    "unusual traffic from your",
    "enter the characters you see",
    "请完成安全验证",
];

/// Words that only count when they corroborate each other.
const SUPPORTING_WORDS: &[&str] = &[
    "captcha",
    "robot",
    "blocked",
    "too many requests",
    "rate limit",
    "验证码",
    "访问频繁",
];

/// HTTP statuses some sites render as bare text pages.
const ERROR_STATUSES: &[(&str, &str)] = &[
    ("403", "forbidden"),
    ("404", "not found"),
    ("429", "too many requests"),
];

/// A positive verdict: the accumulated score and the evidence behind it.
#[derive(Clone, Debug)]
pub struct Challenge {
    pub score: u32,
    pub reason: String,
}

/// Score the page against the evidence tables. `None` means the page looks
/// like an ordinary document.
pub fn assess(title: &str, body: &str, url: Option<&str>) -> Option<Challenge> {
    let title = title.to_lowercase();
    let body = body.to_lowercase();
    let url = url.unwrap_or("").to_lowercase();

    let mut score = 0;
    let mut evidence: Vec<String> = Vec::new();

    if let Some(marker) = URL_MARKERS.iter().find(|marker| url.contains(*marker)) {
        score += CONCLUSIVE;
        evidence.push(format!("url contains '{marker}'"));
    }

    if let Some(marker) = TITLE_MARKERS.iter().find(|marker| title.contains(*marker)) {
        score += CONCLUSIVE;
        evidence.push(format!("interstitial title '{marker}'"));
    }

    if let Some((code, phrase)) = ERROR_STATUSES.iter().find(|(code, phrase)| {
        (title.contains(code) && title.contains(phrase))
            || body.contains(&format!("{code} {phrase}"))
    }) {
        score += CONCLUSIVE;
        evidence.push(format!("page renders http {code} {phrase}"));
    }

    if let Some(phrase) = DECISIVE_PHRASES
        .iter()
        .find(|phrase| body.contains(*phrase) || title.contains(*phrase))
    {
        score += CONCLUSIVE;
        evidence.push(format!("challenge wording '{phrase}'"));
    }

    let supporting: Vec<&str> = SUPPORTING_WORDS
        .iter()
        .filter(|word| body.contains(*word) || title.contains(*word))
        .copied()
        .collect();
    match supporting.len() {
        0 => {}
        // One generic word alone is how blog posts about captchas look.
        1 => {
            score += CORROBORATING;
            evidence.push(format!("mentions '{}'", supporting[0]));
        }
        _ => {
            score += CONCLUSIVE;
            evidence.push(format!("mentions {}", supporting.join(", ")));
        }
    }

    if score >= SCORE_THRESHOLD {
        Some(Challenge {
            score,
            reason: evidence.join("; "),
        })
    } else {
        None
    }
}

/// Poll the page while a challenge is showing, up to `deadline`. Best-effort:
/// read failures and expiry are logged, never raised.
pub async fn wait_while_challenged(page: &PageHandle, deadline: Duration) {
    let limit = Instant::now() + deadline;
    loop {
        let signals = page
            .evaluate(
                "(() => ({ title: document.title, body: (document.body ? document.body.innerText : '').slice(0, 4000) }))()",
            )
            .await;
        let (title, body) = match signals {
            Ok(value) => (
                value
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                value
                    .get("body")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ),
            Err(err) => {
                debug!(target: "tab-controller", %err, "challenge probe failed");
                return;
            }
        };

        let url = page.url().await;
        match assess(&title, &body, Some(&url)) {
            Some(challenge) => {
                if Instant::now() >= limit {
                    warn!(
                        target: "tab-controller",
                        reason = %challenge.reason,
                        "challenge still present; continuing anyway"
                    );
                    return;
                }
                warn!(
                    target: "tab-controller",
                    reason = %challenge.reason,
                    score = challenge.score,
                    "challenge detected; waiting for it to clear"
                );
                sleep(Duration::from_secs(1)).await;
            }
            None => return,
        }
    }
}
