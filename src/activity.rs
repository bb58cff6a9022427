use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::ansi::floor_char_boundary;
use crate::types::InjectionBlock;

/// How long after injection the wrapped program gets to show signs of life.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(10);

const OUTPUT_BUFFER_MAX_BYTES: usize = 16_000;
const OUTPUT_BUFFER_KEEP_BYTES: usize = 12_000;

/// Tool-use markers per wrapped CLI. Output matching one of these shortly
/// after injection is the strongest evidence the message was picked up.
#[derive(Debug, Clone)]
pub struct ActivityDetector {
    patterns: Vec<&'static str>,
}

impl ActivityDetector {
    pub fn for_cli(cli: &str) -> Self {
        let base = cli
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(cli)
            .to_ascii_lowercase();
        let patterns = if base.contains("claude") {
            vec!["⠋", "⠙", "⠹", "Tool:", "Read(", "Write(", "Edit("]
        } else if base.contains("codex") {
            vec!["Thinking...", "Running:", "$ ", "function_call"]
        } else if base.contains("gemini") {
            vec!["Generating", "Action:", "Executing"]
        } else {
            // Unknown program: any non-echo output counts.
            Vec::new()
        };
        Self { patterns }
    }

    /// Match activity in already-ANSI-stripped output, ignoring the echoed
    /// injection itself.
    pub fn detect(&self, clean_output: &str, expected_echo: &str) -> Option<String> {
        let relevant = if let Some(pos) = clean_output.find(expected_echo) {
            let before = &clean_output[..pos];
            let after = &clean_output[pos + expected_echo.len()..];
            format!("{before}{after}")
        } else {
            clean_output.to_string()
        };

        if self.patterns.is_empty() {
            if relevant.trim().is_empty() {
                None
            } else {
                Some("any_output".to_string())
            }
        } else {
            self.patterns
                .iter()
                .find(|pattern| relevant.contains(**pattern))
                .map(|pattern| (*pattern).to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityHit {
    pub token: String,
    pub delivery_ids: Vec<String>,
    pub pattern: String,
    pub latency_ms: u64,
}

#[derive(Debug)]
struct TrackedBlock {
    token: String,
    delivery_ids: Vec<String>,
    expected_echo: String,
    injected_at: Instant,
    output: String,
}

/// Watches post-injection output for tool-use markers, one entry per
/// injected block until it fires or its window lapses.
#[derive(Debug)]
pub struct ActivityMonitor {
    detector: ActivityDetector,
    window: Duration,
    pending: VecDeque<TrackedBlock>,
}

impl ActivityMonitor {
    pub fn new(detector: ActivityDetector) -> Self {
        Self {
            detector,
            window: ACTIVITY_WINDOW,
            pending: VecDeque::new(),
        }
    }

    #[cfg(test)]
    fn with_window(detector: ActivityDetector, window: Duration) -> Self {
        Self {
            detector,
            window,
            pending: VecDeque::new(),
        }
    }

    pub fn track(&mut self, block: &InjectionBlock, payload: String, now: Instant) {
        self.pending.push_back(TrackedBlock {
            token: block.token.clone(),
            delivery_ids: block.delivery_ids.clone(),
            expected_echo: payload,
            injected_at: now,
            output: String::new(),
        });
    }

    /// Feed ANSI-stripped output; returns every block whose window just
    /// produced a match.
    pub fn feed(&mut self, clean_chunk: &str, now: Instant) -> Vec<ActivityHit> {
        let mut hits = Vec::new();
        let mut idx = 0;
        while idx < self.pending.len() {
            let tracked = &mut self.pending[idx];
            if now.duration_since(tracked.injected_at) >= self.window {
                self.pending.remove(idx);
                continue;
            }
            tracked.output.push_str(clean_chunk);
            if tracked.output.len() > OUTPUT_BUFFER_MAX_BYTES {
                let start = floor_char_boundary(
                    &tracked.output,
                    tracked.output.len() - OUTPUT_BUFFER_KEEP_BYTES,
                );
                tracked.output.drain(..start);
            }
            if let Some(pattern) = self
                .detector
                .detect(&tracked.output, &tracked.expected_echo)
            {
                if let Some(tracked) = self.pending.remove(idx) {
                    hits.push(ActivityHit {
                        token: tracked.token,
                        delivery_ids: tracked.delivery_ids,
                        pattern,
                        latency_ms: now.duration_since(tracked.injected_at).as_millis() as u64,
                    });
                }
                continue;
            }
            idx += 1;
        }
        hits
    }

    /// Drop entries whose window lapsed without a match.
    pub fn expire(&mut self, now: Instant) {
        self.pending
            .retain(|t| now.duration_since(t.injected_at) < self.window);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
