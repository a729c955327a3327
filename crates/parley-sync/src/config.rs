use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Tuning for feed and reaction synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How far apart a pending message and a confirmed record may be
    /// timestamped and still be matched by content.
    pub match_window: Duration,

    /// A send that has not answered by then is marked failed.
    pub send_timeout: Duration,

    /// Pause before reopening a dropped change feed.
    pub resubscribe_delay: Duration,

    /// Consecutive resubscribe failures tolerated before giving up.
    pub max_resubscribe_attempts: u32,

    /// Messages requested per `load_older` page.
    pub page_size: u32,

    /// Change-feed events held while a snapshot is in flight. Overflow
    /// discards them and forces another fetch.
    pub max_buffered_events: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            match_window: Duration::from_secs(30),
            send_timeout: Duration::from_secs(15),
            resubscribe_delay: Duration::from_secs(1),
            max_resubscribe_attempts: 5,
            page_size: 50,
            max_buffered_events: 1000,
        }
    }
}

impl SyncConfig {
    /// Read `PARLEY_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            match_window: Duration::from_secs(parse_or(
                &lookup,
                "PARLEY_MATCH_WINDOW_SECS",
                defaults.match_window.as_secs(),
            )?),
            send_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PARLEY_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            resubscribe_delay: Duration::from_millis(parse_or(
                &lookup,
                "PARLEY_RESUBSCRIBE_DELAY_MS",
                defaults.resubscribe_delay.as_millis() as u64,
            )?),
            max_resubscribe_attempts: parse_or(
                &lookup,
                "PARLEY_MAX_RESUBSCRIBE_ATTEMPTS",
                defaults.max_resubscribe_attempts,
            )?,
            page_size: parse_or(&lookup, "PARLEY_PAGE_SIZE", defaults.page_size)?.max(1),
            max_buffered_events: parse_or(
                &lookup,
                "PARLEY_MAX_BUFFERED_EVENTS",
                defaults.max_buffered_events,
            )?,
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
