//! Backend server management
//!
//! Tracks the state of every configured backend and picks the next one in
//! round-robin order. A pool belongs to one proxy module instance, which is
//! owned by a single worker, so no locking is involved.

use std::time::Instant;

use crate::config::BackendConfig;

/// Consecutive failures after which a backend is taken out of rotation.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Represents the current state of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Backend is healthy and accepting requests
    Up,
    /// Backend is down or unreachable
    Down,
}

/// Represents a backend server with its metadata
#[derive(Debug, Clone)]
pub struct Backend {
    /// Backend URL (e.g., "http://localhost:3000")
    pub url: String,
    /// Label used in logs instead of the URL
    pub name: Option<String>,
    /// Whether the backend is in rotation
    pub state: BackendState,
    /// Last time a request to this backend completed or failed
    pub last_check: Option<Instant>,
    /// Failures since the last successful exchange
    pub consecutive_failures: u32,
}

impl Backend {
    /// Builds a backend from its configuration entry, initially up
    pub fn new(config: BackendConfig) -> Self {
        Self {
            url: config.url,
            name: config.name,
            state: BackendState::Up,
            last_check: None,
            consecutive_failures: 0,
        }
    }

    /// Name for logging, falling back to the URL
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    /// Records a failed exchange, taking the backend down at the threshold
    pub fn mark_failed(&mut self) {
        self.consecutive_failures += 1;
        self.last_check = Some(Instant::now());

        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && self.state == BackendState::Up {
            self.state = BackendState::Down;
            tracing::warn!(
                backend = self.display_name(),
                failures = self.consecutive_failures,
                "Backend marked as down"
            );
        }
    }

    /// Records a successful exchange and brings the backend back up
    pub fn mark_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_check = Some(Instant::now());

        if self.state == BackendState::Down {
            self.state = BackendState::Up;
            tracing::info!(backend = self.display_name(), "Backend recovered");
        }
    }

    /// Whether requests may be routed here
    pub fn is_available(&self) -> bool {
        self.state == BackendState::Up
    }
}

/// Pool of backend servers
#[derive(Debug, Clone, Default)]
pub struct BackendPool {
    backends: Vec<Backend>,
    next: usize,
}

impl BackendPool {
    /// Builds a pool from the configured backends, in order
    pub fn new(configs: Vec<BackendConfig>) -> Self {
        Self {
            backends: configs.into_iter().map(Backend::new).collect(),
            next: 0,
        }
    }

    /// Index of the next available backend in round-robin order.
    ///
    /// When every backend is down the pool falls back to plain round-robin,
    /// so a recovered backend gets the chance to prove itself again.
    pub fn select(&mut self) -> Option<usize> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let start = self.next % len;
        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| self.backends[i].is_available())
            .unwrap_or_else(|| {
                tracing::warn!("No available backends in pool, probing the next one");
                start
            });

        self.next = (index + 1) % len;
        Some(index)
    }

    /// Backend at `index`, as returned by `select`
    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    /// Records a failure against the backend at `index`
    pub fn mark_failed(&mut self, index: usize) {
        if let Some(backend) = self.backends.get_mut(index) {
            backend.mark_failed();
        }
    }

    /// Records a success against the backend at `index`
    pub fn mark_success(&mut self, index: usize) {
        if let Some(backend) = self.backends.get_mut(index) {
            backend.mark_success();
        }
    }

    /// All backends, for status logging
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Number of backends currently in rotation
    pub fn available_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_available()).count()
    }
}
