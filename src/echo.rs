use crate::ansi::{floor_char_boundary, strip_ansi};
use crate::types::InjectionBlock;

/// Number of leading body words the second matching phase samples.
const BODY_WORD_SAMPLE: usize = 12;

/// Fraction of sampled tokens (sender + body words) that must appear in the
/// window once the unique token has matched.
const MIN_TOKEN_FRACTION: f64 = 0.6;

/// Ring of ANSI-stripped child output, overwritten oldest-first. The
/// monotone byte counter lets probes distinguish "not yet echoed" from
/// "echo would have been overwritten by now".
#[derive(Debug)]
pub struct EchoWindow {
    buf: String,
    capacity: usize,
    total: u64,
}

impl EchoWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, raw: &str) {
        let clean = strip_ansi(raw);
        self.total += clean.len() as u64;
        self.buf.push_str(&clean);
        if self.buf.len() > self.capacity {
            let start = floor_char_boundary(&self.buf, self.buf.len() - self.capacity);
            self.buf.drain(..start);
        }
    }

    pub fn contents(&self) -> &str {
        &self.buf
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total clean bytes ever pushed, including overwritten ones.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    Matched,
    /// The window has turned over completely since injection without a
    /// token match. Inconclusive: another channel may still resolve it.
    Evicted,
    Pending,
}

/// Per-block echo check. Phase 1 looks for the short bracketed token;
/// phase 2 confirms enough of the surrounding text survived reformatting.
#[derive(Debug, Clone)]
pub struct EchoProbe {
    token: String,
    sender: String,
    body_words: Vec<String>,
    injected_total: u64,
}

impl EchoProbe {
    pub fn for_block(block: &InjectionBlock, window: &EchoWindow) -> Self {
        let body = block.bodies.join(" ");
        let body_words = body
            .split_whitespace()
            .take(BODY_WORD_SAMPLE)
            .map(str::to_owned)
            .collect();
        Self {
            token: format!("[{}]", block.token),
            sender: block.sender.clone(),
            body_words,
            injected_total: window.total_bytes(),
        }
    }

    pub fn check(&self, window: &EchoWindow) -> EchoOutcome {
        let text = window.contents();
        if !text.contains(&self.token) {
            let appended = window.total_bytes().saturating_sub(self.injected_total);
            if appended > window.capacity() as u64 {
                return EchoOutcome::Evicted;
            }
            return EchoOutcome::Pending;
        }

        // Token hit; require a minimum fraction of sampled tokens anywhere
        // in the window, in any order, so line-wrapping does not defeat us.
        let mut expected = 1usize;
        let mut found = usize::from(text.contains(self.sender.as_str()));
        expected += self.body_words.len();
        found += self
            .body_words
            .iter()
            .filter(|word| text.contains(word.as_str()))
            .count();

        if found as f64 / expected as f64 >= MIN_TOKEN_FRACTION {
            EchoOutcome::Matched
        } else {
            EchoOutcome::Pending
        }
    }
}
