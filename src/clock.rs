//! Wall-clock capability shared by every polling loop.
//!
//! All scheduling in the bot is coarse polling against exchange-local time.
//! Loops take an `Arc<dyn Clock>` so tests can drive them with virtual time.

use async_trait::async_trait;
#[cfg(test)]
use chrono::Duration as ChronoDuration;
use chrono::{FixedOffset, NaiveDateTime, NaiveTime, Offset, Utc};
use std::time::Duration;

/// Source of exchange-local time plus the ability to wait.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current exchange-local date and time.
    fn now(&self) -> NaiveDateTime;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Current exchange-local time of day.
    fn time(&self) -> NaiveTime {
        self.now().time()
    }
}

/// Real clock pinned to a fixed UTC offset (IST by default).
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Create a clock for the given offset from UTC, in minutes.
    pub fn new(utc_offset_minutes: i32) -> Self {
        // Out-of-range offsets fall back to UTC.
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or(Utc.fix());
        Self { offset }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests: `sleep` advances time instead of waiting.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<NaiveDateTime>,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Build a clock from `"YYYY-MM-DD HH:MM:SS"`.
    pub fn parse(s: &str) -> Self {
        Self::at(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::from_std(duration).unwrap();
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
