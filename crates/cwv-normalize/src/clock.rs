use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub const DATE_FORMAT: &str = "%d-%m-%Y";
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Wall clock rendered in the configured time zone.
#[derive(Clone)]
pub struct ZonedClock {
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl ZonedClock {
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { clock, tz }
    }

    pub fn system(tz: Tz) -> Self {
        Self::new(Arc::new(SystemClock), tz)
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// `dd-MM-yyyy` in the configured zone.
    pub fn date(&self) -> String {
        self.clock
            .now()
            .with_timezone(&self.tz)
            .format(DATE_FORMAT)
            .to_string()
    }

    /// `dd-MM-yyyy HH:mm:ss` in the configured zone.
    pub fn timestamp(&self) -> String {
        self.clock
            .now()
            .with_timezone(&self.tz)
            .format(TIMESTAMP_FORMAT)
            .to_string()
    }
}

impl std::fmt::Debug for ZonedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedClock").field("tz", &self.tz).finish()
    }
}
