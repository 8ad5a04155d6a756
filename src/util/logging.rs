//! # Logging Utilities
//!
//! Rate limiting for log messages that repeat while a meter is unreachable,
//! and hex dumps of KMP frames for protocol debugging.
//!
//! ```rust
//! use kamstrup_rs::util::logging::{LogThrottle, log_frame_hex};
//!
//! let mut throttle = LogThrottle::new(60_000, 5); // 5 messages per minute
//! if throttle.allow() {
//!     log::warn!("Meter did not answer");
//! }
//! log_frame_hex("TX", &[0x80, 0x3F, 0x10, 0x01, 0x00, 0x3C]);
//! ```

use std::collections::HashMap;
use std::time::Instant;

/// Hex dumps longer than this are cut off.
const MAX_LOG_BYTES: usize = 64;

/// Throttling structure for rate-limiting log messages
///
/// A meter that is unplugged fails every poll; without throttling the same
/// warning would be logged once per interval forever.
#[derive(Debug)]
pub struct LogThrottle {
    /// Time window for throttling (in milliseconds)
    window_ms: u64,
    /// Maximum messages allowed per window
    cap: u32,
    /// Current message count in window
    count: u32,
    /// Messages suppressed in the current window
    suppressed: u32,
    /// Start time of current window
    t0: Instant,
}

impl LogThrottle {
    /// Create new throttle with time window and message cap
    ///
    /// # Arguments
    /// * `window_ms` - Time window in milliseconds
    /// * `cap` - Maximum messages allowed per window
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window_ms,
            cap,
            count: 0,
            suppressed: 0,
            t0: Instant::now(),
        }
    }

    /// Check if logging is allowed (resets counter after window expires)
    ///
    /// When a new window starts after messages were dropped, one debug line
    /// reports how many.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.t0).as_millis() as u64;

        if elapsed_ms > self.window_ms {
            if self.suppressed > 0 {
                log::debug!("{} log messages suppressed", self.suppressed);
            }
            self.t0 = now;
            self.count = 0;
            self.suppressed = 0;
        }

        self.count = self.count.saturating_add(1);
        let allowed = self.count <= self.cap;
        if !allowed {
            self.suppressed = self.suppressed.saturating_add(1);
        }
        allowed
    }

    /// Reset the throttle (start new window immediately)
    pub fn reset(&mut self) {
        if self.suppressed > 0 {
            log::debug!("{} log messages suppressed", self.suppressed);
        }
        self.t0 = Instant::now();
        self.count = 0;
        self.suppressed = 0;
    }
}

/// Independent throttles per message category, e.g. one for link failures
/// and one for batch failures.
#[derive(Debug)]
pub struct ThrottleManager {
    throttles: HashMap<&'static str, LogThrottle>,
    window_ms: u64,
    cap: u32,
}

impl ThrottleManager {
    /// Every category gets `cap` messages per `window_ms`.
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            throttles: HashMap::new(),
            window_ms,
            cap,
        }
    }

    /// Check if logging is allowed for a specific category
    pub fn allow(&mut self, category: &'static str) -> bool {
        let (window_ms, cap) = (self.window_ms, self.cap);
        self.throttles
            .entry(category)
            .or_insert_with(|| LogThrottle::new(window_ms, cap))
            .allow()
    }

    /// Reset all throttles, e.g. once the meter answers again
    pub fn reset_all(&mut self) {
        for throttle in self.throttles.values_mut() {
            throttle.reset();
        }
    }
}

/// Log frame data in hex format for debugging
pub fn log_frame_hex(prefix: &str, data: &[u8]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }

    let shown = &data[..data.len().min(MAX_LOG_BYTES)];
    let suffix = if data.len() > MAX_LOG_BYTES {
        format!(" ... ({} bytes total)", data.len())
    } else {
        String::new()
    };

    log::debug!(
        target: "kamstrup::frame",
        "{prefix}: {}{suffix}",
        hex::encode_upper(shown)
    );
}
