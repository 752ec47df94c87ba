use super::host_key;
use crate::config::BreakerConfig;
use dashmap::DashMap;
use protocol::control::{BreakerState, HostHealthSnapshot};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HostHealth {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub breaker_open_until: Option<Instant>,
    recent_failures: VecDeque<Instant>,
    probe_in_flight: bool,
}

impl HostHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_at: None,
            breaker_open_until: None,
            recent_failures: VecDeque::new(),
            probe_in_flight: false,
        }
    }

    fn state(&self, now: Instant) -> BreakerState {
        match self.breaker_open_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }

    fn retry_in(&self, now: Instant) -> Duration {
        self.breaker_open_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// Outcome of asking the breaker whether a host may be contacted.
#[derive(Debug)]
pub enum Admission {
    Closed,
    /// The single trial call allowed after the cool-down.
    Probe(ProbeTicket),
    Rejected { retry_in: Duration },
}

/// Marks the half-open probe as in flight until dropped.
#[derive(Debug)]
pub struct ProbeTicket {
    hosts: Arc<DashMap<String, HostHealth>>,
    key: String,
}

impl Drop for ProbeTicket {
    fn drop(&mut self) {
        if let Some(mut health) = self.hosts.get_mut(&self.key) {
            health.probe_in_flight = false;
        }
    }
}

/// Per-host failure tracking.
///
/// Hosts are independent; a host opens once `failure_threshold` connection
/// failures land inside the lookback window, stays open for the cool-down,
/// then lets exactly one probe through. A successful probe closes it, a failed
/// probe re-opens it with a fresh cool-down.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    hosts: Arc<DashMap<String, HostHealth>>,
    failure_threshold: u32,
    cooldown: Duration,
    lookback: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            hosts: Arc::new(DashMap::new()),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            lookback: config.lookback(),
        }
    }

    pub fn is_open(&self, host: &str) -> bool {
        let now = Instant::now();
        self.hosts
            .get(&host_key(host))
            .map(|health| health.state(now) == BreakerState::Open)
            .unwrap_or(false)
    }

    pub fn admit(&self, host: &str) -> Admission {
        let key = host_key(host);
        let now = Instant::now();
        let Some(mut health) = self.hosts.get_mut(&key) else {
            return Admission::Closed;
        };
        match health.state(now) {
            BreakerState::Closed => Admission::Closed,
            BreakerState::Open => Admission::Rejected {
                retry_in: health.retry_in(now),
            },
            BreakerState::HalfOpen if health.probe_in_flight => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            BreakerState::HalfOpen => {
                health.probe_in_flight = true;
                drop(health);
                tracing::info!(event = "breaker.probe", host = %key);
                Admission::Probe(ProbeTicket {
                    hosts: Arc::clone(&self.hosts),
                    key,
                })
            }
        }
    }

    /// Counts a connection-level failure; returns true when this call opened
    /// the breaker.
    pub fn record_failure(&self, host: &str) -> bool {
        let key = host_key(host);
        let now = Instant::now();
        let mut health = self.hosts.entry(key.clone()).or_insert_with(HostHealth::new);
        if let Some(horizon) = now.checked_sub(self.lookback) {
            while health
                .recent_failures
                .front()
                .is_some_and(|at| *at <= horizon)
            {
                health.recent_failures.pop_front();
            }
        }
        health.recent_failures.push_back(now);
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure_at = Some(now);

        let opened = match health.state(now) {
            BreakerState::Open => false,
            BreakerState::HalfOpen => true,
            BreakerState::Closed => health.recent_failures.len() >= self.failure_threshold as usize,
        };
        if opened {
            health.breaker_open_until = Some(now + self.cooldown);
            health.probe_in_flight = false;
            tracing::warn!(
                event = "breaker.opened",
                host = %key,
                consecutive_failures = health.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
            );
        } else {
            tracing::debug!(
                event = "breaker.failure",
                host = %key,
                recent_failures = health.recent_failures.len(),
            );
        }
        opened
    }

    pub fn record_success(&self, host: &str) {
        let key = host_key(host);
        if let Some((_, previous)) = self.hosts.remove(&key) {
            if previous.breaker_open_until.is_some() {
                tracing::info!(event = "breaker.closed", host = %key);
            }
        }
    }

    /// Forgets all failure history for `host`; returns whether any existed.
    pub fn reset(&self, host: &str) -> bool {
        let key = host_key(host);
        let existed = self.hosts.remove(&key).is_some();
        if existed {
            tracing::info!(event = "breaker.reset", host = %key);
        }
        existed
    }

    pub fn health(&self, host: &str) -> Option<HostHealth> {
        self.hosts.get(&host_key(host)).map(|health| health.clone())
    }

    pub fn snapshot(&self) -> Vec<HostHealthSnapshot> {
        let now = Instant::now();
        let mut hosts: Vec<HostHealthSnapshot> = self
            .hosts
            .iter()
            .map(|entry| {
                let health = entry.value();
                HostHealthSnapshot {
                    host: entry.key().clone(),
                    state: health.state(now),
                    consecutive_failures: health.consecutive_failures,
                    retry_in_secs: health.retry_in(now).as_secs(),
                    probe_in_flight: health.probe_in_flight,
                }
            })
            .collect();
        hosts.sort_by(|left, right| left.host.cmp(&right.host));
        hosts
    }
}
