//! Fixed-rate reveal of streamed text.
//!
//! Deltas arrive in bursts; the pacer queues their characters and releases
//! them at `chars_per_second`, never more than `max_chars_per_tick` at once.
//! The caller owns the timer and calls [`CharacterPacer::tick`] on every
//! beat, passing the current instant, so pacing is deterministic under test.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Slowest reveal rate. Lower, zero or NaN rates are raised to it so a
/// queued reply always drains.
pub const MIN_CHARS_PER_SECOND: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    pub chars_per_second: f64,
    pub max_chars_per_tick: usize,
    pub tick: Duration,
    /// Characters the queue may hold. The excess is released on the next
    /// tick regardless of `max_chars_per_tick`.
    pub queue_capacity: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            chars_per_second: 60.0,
            max_chars_per_tick: 12,
            tick: Duration::from_millis(16),
            queue_capacity: 16_384,
        }
    }
}

/// Text released by one tick, to be appended to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub target: String,
    pub text: String,
}

pub struct CharacterPacer {
    config: PacerConfig,
    target: String,
    queue: VecDeque<char>,
    running: bool,
    last_tick: Option<Instant>,
    /// Fractional character budget left over from previous ticks.
    carry: f64,
}

impl CharacterPacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            target: String::new(),
            queue: VecDeque::new(),
            running: false,
            last_tick: None,
            carry: 0.0,
        }
    }

    /// Queue `text` for `target`. Starts the consumer if it was idle.
    pub fn enqueue(&mut self, target: &str, text: &str, now: Instant) {
        if text.is_empty() {
            return;
        }
        if self.target != target {
            self.target = target.to_string();
        }
        self.queue.extend(text.chars());

        if !self.running {
            self.running = true;
            self.last_tick = Some(now);
            self.carry = 0.0;
        }
    }

    /// Release the characters due at `now`.
    pub fn tick(&mut self, now: Instant) -> Option<Release> {
        if !self.running {
            return None;
        }

        let last = self.last_tick.unwrap_or(now);
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        self.last_tick = Some(now);

        let rate = self.config.chars_per_second.max(MIN_CHARS_PER_SECOND);
        let exact = elapsed * rate + self.carry;
        let budget = exact.floor();
        self.carry = exact - budget;

        let paced = self
            .queue
            .len()
            .min(self.config.max_chars_per_tick)
            .min(budget as usize);
        let overflow = self
            .queue
            .len()
            .saturating_sub(self.config.queue_capacity);
        let take = paced.max(overflow);

        let text: String = self.queue.drain(..take).collect();

        if self.queue.is_empty() {
            self.stop();
        }

        if text.is_empty() {
            None
        } else {
            Some(Release {
                target: self.target.clone(),
                text,
            })
        }
    }

    /// Stop the consumer and discard everything not yet released.
    /// Returns the number of discarded characters.
    pub fn flush_and_stop(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        self.stop();
        discarded
    }

    /// Follow a rename of the entry being written.
    pub fn retarget(&mut self, target: &str) {
        self.target = target.to_string();
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && !self.running
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pending_chars(&self) -> usize {
        self.queue.len()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    fn stop(&mut self) {
        self.running = false;
        self.last_tick = None;
        self.carry = 0.0;
    }
}
