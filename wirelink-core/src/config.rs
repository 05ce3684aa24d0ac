//! Configuration for endpoints and the queued resend layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{SourceTag, SOURCE_DEVICE};

/// Default capacity of the bounded inbound channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 512;

/// Configuration for an [`crate::endpoint::Endpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Source tag stamped on envelopes this endpoint originates.
    pub source: SourceTag,
    /// Capacity of the bounded inbound channel. When consumers fall behind,
    /// the listen loop drops parsed envelopes rather than block the read
    /// pipeline.
    pub inbound_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { source: SOURCE_DEVICE.to_owned(), inbound_capacity: DEFAULT_INBOUND_CAPACITY }
    }
}

impl EndpointConfig {
    /// Config with the given source tag and default capacity.
    #[must_use]
    pub fn with_source(source: impl Into<SourceTag>) -> Self {
        Self { source: source.into(), ..Self::default() }
    }
}

/// Configuration for a [`crate::queue::QueuedEndpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum entries held before capacity displacement kicks in.
    pub max_queue_size: usize,
    /// Drop non-critical entries older than this at flush time.
    pub max_message_age: Duration,
    /// Drop critical entries older than this at flush time.
    pub max_critical_age: Duration,
    /// Cadence of the background flusher.
    pub flush_interval: Duration,
    /// Retry budget for non-critical entries.
    pub max_retries: u32,
    /// Retry budget for critical entries.
    pub max_critical_retries: u32,
    /// Source tag stamped on convenience sends from the queued layer.
    pub source: SourceTag,
    /// Actions beginning with any of these prefixes are critical: they get
    /// priority retention, the longer age bound, the larger retry budget,
    /// and their queued sends report success instead of a transport error.
    pub critical_action_prefixes: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_message_age: Duration::from_secs(30),
            max_critical_age: Duration::from_secs(60),
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            max_critical_retries: 10,
            source: SOURCE_DEVICE.to_owned(),
            critical_action_prefixes: Vec::new(),
        }
    }
}

impl QueueConfig {
    /// Retry budget applicable to an entry.
    #[must_use]
    pub const fn retry_budget(&self, critical: bool) -> u32 {
        if critical {
            self.max_critical_retries
        } else {
            self.max_retries
        }
    }

    /// Age bound applicable to an entry.
    #[must_use]
    pub const fn age_budget(&self, critical: bool) -> Duration {
        if critical {
            self.max_critical_age
        } else {
            self.max_message_age
        }
    }
}
