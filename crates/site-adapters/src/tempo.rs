//! Human-tempo sampling for typing and pacing.
//!
//! All sampling is synchronous so plans can be built before the first await.

use std::time::Duration;

use rand::{thread_rng, Rng};

const THINK_MS: (u64, u64) = (1_200, 2_000);
const PRE_SEND_MS: (u64, u64) = (800, 1_600);
const PER_CHAR_MS: (u64, u64) = (40, 120);
const CHUNK_PAUSE_MS: (u64, u64) = (80, 280);
const CHUNK_PAUSE_PROBABILITY: f64 = 0.2;
const MAX_CHUNK_CHARS: usize = 3;

/// Pause before interacting with a freshly focused page.
pub fn think_delay() -> Duration {
    sample_ms(THINK_MS)
}

/// Pause between finishing typing and pressing send.
pub fn pre_send_delay() -> Duration {
    sample_ms(PRE_SEND_MS)
}

/// Small pause between hover and click, sampled like a single keystroke.
pub fn micro_delay() -> Duration {
    sample_ms(PER_CHAR_MS)
}

/// One chunk of text to insert after waiting out its delay.
#[derive(Clone, Debug)]
pub struct TypingStep {
    pub chunk: String,
    pub delay: Duration,
}

/// Break `text` into 1–3 character chunks, each carrying the summed
/// per-character delay plus an occasional extra pause.
pub fn typing_plan(text: &str) -> Vec<TypingStep> {
    let mut rng = thread_rng();
    let chars: Vec<char> = text.chars().collect();
    let mut steps = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let size = rng.gen_range(1..=MAX_CHUNK_CHARS).min(chars.len() - index);
        let chunk: String = chars[index..index + size].iter().collect();
        index += size;

        let mut delay_ms: u64 = (0..size)
            .map(|_| rng.gen_range(PER_CHAR_MS.0..=PER_CHAR_MS.1))
            .sum();
        if rng.gen_bool(CHUNK_PAUSE_PROBABILITY) {
            delay_ms += rng.gen_range(CHUNK_PAUSE_MS.0..=CHUNK_PAUSE_MS.1);
        }

        steps.push(TypingStep {
            chunk,
            delay: Duration::from_millis(delay_ms),
        });
    }

    steps
}

fn sample_ms(range: (u64, u64)) -> Duration {
    Duration::from_millis(thread_rng().gen_range(range.0..=range.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_reassembles_the_original_text() {
        let text = "hello, how are you today?";
        let plan = typing_plan(text);
        let rebuilt: String = plan.iter().map(|step| step.chunk.as_str()).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunks_stay_within_bounds() {
        for step in typing_plan("some reasonably long prompt text to slice up") {
            let len = step.chunk.chars().count();
            assert!((1..=MAX_CHUNK_CHARS).contains(&len));
            let min = Duration::from_millis(PER_CHAR_MS.0 * len as u64);
            let max =
                Duration::from_millis(PER_CHAR_MS.1 * len as u64 + CHUNK_PAUSE_MS.1);
            assert!(step.delay >= min, "delay {:?} under {:?}", step.delay, min);
            assert!(step.delay <= max, "delay {:?} over {:?}", step.delay, max);
        }
    }

    #[test]
    fn plan_handles_multibyte_text() {
        let text = "héllo wörld 你好";
        let plan = typing_plan(text);
        let rebuilt: String = plan.iter().map(|step| step.chunk.as_str()).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn delays_sample_inside_their_ranges() {
        for _ in 0..32 {
            let think = think_delay();
            assert!(think >= Duration::from_millis(THINK_MS.0));
            assert!(think <= Duration::from_millis(THINK_MS.1));
            let pre = pre_send_delay();
            assert!(pre >= Duration::from_millis(PRE_SEND_MS.0));
            assert!(pre <= Duration::from_millis(PRE_SEND_MS.1));
        }
    }

    #[test]
    fn empty_text_yields_empty_plan() {
        assert!(typing_plan("").is_empty());
    }
}
