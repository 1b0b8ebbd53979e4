//! Transport configuration and retry schedules.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Configuration for the Wiz UDP transport.
///
/// Every field has a default, so a partial (or empty) JSON object is enough.
///
/// # Example
///
/// ```
/// use wiz_script_rs::TransportConfig;
///
/// let config = TransportConfig::from_json(r#"{"port": 40000}"#).unwrap();
/// assert_eq!(config.port, 40000);
/// assert_eq!(config.broadcast_address.to_string(), "255.255.255.255");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// The UDP port bulbs listen on.
    pub port: u16,
    pub broadcast_address: Ipv4Addr,
    /// Size of the buffer each datagram is received into.
    pub receive_buffer: usize,
    pub retry: RetryOptions,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            port: 38899,
            broadcast_address: Ipv4Addr::BROADCAST,
            receive_buffer: 4096,
            retry: RetryOptions::default(),
        }
    }
}

impl TransportConfig {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(Error::json_load)
    }
}

/// How often to resend a message that hasn't been answered.
///
/// `timeouts` is a list of `(step, end)` pairs in seconds. Resends happen every
/// `step` seconds until more than `end` seconds have passed, then the next pair
/// takes over. The last step repeats forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub timeouts: Vec<(f64, f64)>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            timeouts: vec![(0.2, 0.2), (0.1, 0.5), (0.2, 1.0), (1.0, 5.0)],
        }
    }
}

impl RetryOptions {
    pub fn ticker(&self) -> RetryTicker {
        RetryTicker {
            timeouts: self
                .timeouts
                .iter()
                .map(|&(step, end)| (to_millis(step).max(1), to_millis(end)))
                .collect(),
            index: 0,
            elapsed: 0,
        }
    }
}

fn to_millis(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

/// The gaps between successive sends of one message.
///
/// ```
/// use std::time::Duration;
/// use wiz_script_rs::RetryOptions;
///
/// let options = RetryOptions { timeouts: vec![(0.1, 0.1), (0.2, 0.5), (0.5, 3.0)] };
/// let gaps: Vec<_> = options.ticker().take(5).map(|d| d.as_millis()).collect();
/// assert_eq!(gaps, vec![100, 100, 200, 200, 500]);
/// ```
#[derive(Debug, Clone)]
pub struct RetryTicker {
    timeouts: Vec<(u64, u64)>,
    index: usize,
    elapsed: u64,
}

impl Iterator for RetryTicker {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let (mut step, end) = *self.timeouts.get(self.index)?;
        if self.elapsed > end && self.index + 1 < self.timeouts.len() {
            self.index += 1;
            step = self.timeouts[self.index].0;
        }
        self.elapsed += step;
        Some(Duration::from_millis(step))
    }
}
