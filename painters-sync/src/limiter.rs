//! Per-connection cooldown for pixel writes.
//!
//! Each connection may mutate the canvas at most once per cooldown
//! interval. Distinct connections are independent. Rejected requests leave
//! no trace: the timestamp only moves on an allowed write.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::broadcast::ConnectionId;

pub struct RateLimiter {
    cooldown: Duration,
    last_mutation: HashMap<ConnectionId, Instant>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_mutation: HashMap::new(),
        }
    }

    /// Allow the write if the cooldown has elapsed (or no write is on record),
    /// recording `now` as the connection's last mutation.
    pub fn allow(&mut self, connection: ConnectionId, now: Instant) -> bool {
        if let Some(last) = self.last_mutation.get(&connection) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_mutation.insert(connection, now);
        true
    }

    /// Drop the record for a closed connection.
    pub fn forget(&mut self, connection: &ConnectionId) {
        self.last_mutation.remove(connection);
    }

    /// Minimum spacing between two allowed writes; zero disables the limit.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Number of connections with a write on record.
    pub fn tracked(&self) -> usize {
        self.last_mutation.len()
    }
}
