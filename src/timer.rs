//! # Timer Module
//!
//! Named timers a spider's rule code can block on.
//!
//! A timer is either a countdown, which sleeps a fixed duration every time it
//! runs, or an alarm, which sleeps until the next occurrence of a wall-clock
//! time of day ([`Bell`]) and then repeats with a fixed period. Timers are
//! registered once per spider with [`Timers::set`] and run by id with
//! [`Timers::wait`], usually from rule code on a blocking worker thread.
//!
//! Closing the timer set wakes every thread currently waiting, so stopping a
//! spider never leaves a worker parked on a timer.

use crate::error::SpiderError;
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A wall-clock time of day at which an alarm rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bell {
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
}

impl Bell {
    pub fn new(hour: u32, min: u32, sec: u32) -> Self {
        Bell { hour, min, sec }
    }

    fn time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.min, self.sec)
    }
}

#[derive(Debug)]
enum Clock {
    Countdown(Duration),
    Alarm {
        bell: NaiveTime,
        period: TimeDelta,
        next: Option<NaiveDateTime>,
    },
}

impl Clock {
    /// How long the next run sleeps, advancing an alarm past `now`.
    fn next_delay(&mut self, now: NaiveDateTime) -> Duration {
        match self {
            Clock::Countdown(tol) => *tol,
            Clock::Alarm { bell, period, next } => {
                let mut at = match *next {
                    Some(at) => at,
                    None => first_ring(now, *bell),
                };
                while at <= now {
                    at += *period;
                }
                *next = Some(at + *period);
                (at - now).to_std().unwrap_or_default()
            }
        }
    }
}

/// The first time `bell` rings strictly after `now`.
pub(crate) fn first_ring(now: NaiveDateTime, bell: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(bell);
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// The named timers of one spider.
#[derive(Debug, Default)]
pub struct Timers {
    clocks: Mutex<HashMap<String, Clock>>,
    closed: Mutex<bool>,
    wake: Condvar,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers timer `id`.
    ///
    /// Without a bell the timer is a countdown sleeping `tol` on every run,
    /// and `tol` must be non-zero. With a bell it is an alarm ringing at that
    /// time of day, then every `tol` (every day when `tol` is zero).
    pub fn set(&self, id: &str, tol: Duration, bell: Option<Bell>) -> Result<(), SpiderError> {
        let clock = match bell {
            None if tol.is_zero() => {
                return Err(SpiderError::ConfigurationError(format!(
                    "countdown timer '{}' needs a non-zero duration",
                    id
                )));
            }
            None => Clock::Countdown(tol),
            Some(bell) => {
                let time = bell.time().ok_or_else(|| {
                    SpiderError::ConfigurationError(format!(
                        "alarm timer '{}' has an invalid bell {:02}:{:02}:{:02}",
                        id, bell.hour, bell.min, bell.sec
                    ))
                })?;
                let period = if tol.is_zero() { ONE_DAY } else { tol };
                Clock::Alarm {
                    bell: time,
                    period: TimeDelta::from_std(period).map_err(|e| {
                        SpiderError::ConfigurationError(format!("alarm timer '{}': {}", id, e))
                    })?,
                    next: None,
                }
            }
        };

        let mut clocks = self.clocks.lock();
        if clocks.contains_key(id) {
            warn!("Timer '{}' is already set", id);
            return Err(SpiderError::ConfigurationError(format!(
                "timer '{}' is already set",
                id
            )));
        }
        debug!("Timer '{}' set: {:?}", id, clock);
        clocks.insert(id.to_string(), clock);
        Ok(())
    }

    /// Blocks the calling thread until timer `id` fires.
    ///
    /// Returns `Ok(false)` when the timers were closed before or while
    /// waiting.
    pub fn wait(&self, id: &str) -> Result<bool, SpiderError> {
        let delay = {
            let mut clocks = self.clocks.lock();
            let clock = clocks.get_mut(id).ok_or_else(|| {
                SpiderError::ConfigurationError(format!("timer '{}' is not set", id))
            })?;
            clock.next_delay(Local::now().naive_local())
        };

        debug!("Timer '{}' sleeping for {:?}", id, delay);
        let deadline = Instant::now() + delay;
        let mut closed = self.closed.lock();
        while !*closed {
            if self.wake.wait_until(&mut closed, deadline).timed_out() {
                break;
            }
        }
        Ok(!*closed)
    }

    /// Wakes every waiting thread and makes further waits return at once.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}
