//! Connection state machine and reconnection policy
//!
//! ```text
//! SEARCHING --(port + heartbeat)--> CONNECTED --(I/O error | heartbeat silence)--> DISCONNECTED
//!     ^                                                                               |
//!     +--------------------------(reconnect period > 0)-------------------------------+
//! ```
//!
//! The manager only tracks time and state; the worker owns the port and
//! performs the actual discovery.

use crate::config::Config;
use crate::error::{PedlError, Result};
use crate::types::ConnectionState;
use std::time::{Duration, Instant};

/// Default heartbeat silence after which the device is declared lost
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);

fn positive_secs(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Retry period after a disconnect; `None` stops the engine instead
    pub reconnect_period: Option<Duration>,
    /// Retry period while the first connection has not happened yet
    pub firsttime_retry: Option<Duration>,
    /// Keep running disconnected if the first search fails and no retry is configured
    pub accept_initial_failure: bool,
}

impl ReconnectPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_period: positive_secs(config.reconnect_period_seconds),
            firsttime_retry: positive_secs(config.firsttime_retry_period),
            accept_initial_failure: config.firsttime_accept_fail,
        }
    }
}

/// What the worker should do after the link is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    /// Search again, starting at the next retry time
    Search,
    /// Reconnection is disabled; stop the engine
    Stop,
}

/// Whether a connection is the first one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    First,
    Reconnect,
}

#[derive(Debug)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    watchdog: Duration,
    state: ConnectionState,
    ever_connected: bool,
    /// No more searches will be made
    parked: bool,
    last_heartbeat: Instant,
    next_attempt: Instant,
    connections: u64,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, watchdog: Duration) -> Self {
        let now = Instant::now();
        Self {
            policy,
            watchdog,
            state: ConnectionState::Searching,
            ever_connected: false,
            parked: false,
            last_heartbeat: now,
            next_attempt: now,
            connections: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Time of the next discovery attempt, if one is planned
    pub fn next_attempt(&self) -> Option<Instant> {
        (self.state != ConnectionState::Connected && !self.parked).then_some(self.next_attempt)
    }

    /// Whether a discovery attempt is due
    pub fn should_search(&self, now: Instant) -> bool {
        self.next_attempt().is_some_and(|at| now >= at)
    }

    pub fn on_connected(&mut self, now: Instant) -> ConnectKind {
        self.state = ConnectionState::Connected;
        self.last_heartbeat = now;
        self.connections += 1;
        if self.ever_connected {
            ConnectKind::Reconnect
        } else {
            self.ever_connected = true;
            ConnectKind::First
        }
    }

    /// A discovery attempt found nothing
    ///
    /// Fails with `DeviceNotFound` only before the first connection, when
    /// neither retrying nor running disconnected is allowed.
    pub fn on_search_failed(&mut self, now: Instant, reason: PedlError) -> Result<()> {
        if self.ever_connected {
            match self.policy.reconnect_period {
                Some(period) => self.next_attempt = now + period,
                None => self.parked = true,
            }
            return Ok(());
        }

        if let Some(retry) = self.policy.firsttime_retry {
            tracing::debug!("No device yet, retrying in {:?}", retry);
            self.next_attempt = now + retry;
            return Ok(());
        }

        if self.policy.accept_initial_failure {
            tracing::warn!("No device found, running disconnected: {}", reason);
            self.state = ConnectionState::Disconnected;
            match self.policy.reconnect_period {
                Some(period) => self.next_attempt = now + period,
                None => self.parked = true,
            }
            return Ok(());
        }

        Err(reason)
    }

    pub fn on_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
    }

    pub fn watchdog_expired(&self, now: Instant) -> bool {
        self.state == ConnectionState::Connected
            && now.saturating_duration_since(self.last_heartbeat) > self.watchdog
    }

    /// The link was lost; the state becomes DISCONNECTED
    pub fn on_lost(&mut self, now: Instant) -> LossAction {
        self.state = ConnectionState::Disconnected;
        match self.policy.reconnect_period {
            Some(_) => {
                self.next_attempt = now;
                LossAction::Search
            }
            None => {
                self.parked = true;
                LossAction::Stop
            }
        }
    }

    /// Enter SEARCHING after a loss
    pub fn begin_search(&mut self) {
        self.state = ConnectionState::Searching;
        self.parked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(reconnect: f64, retry: f64, accept: bool) -> ReconnectPolicy {
        let config = Config {
            reconnect_period_seconds: reconnect,
            firsttime_retry_period: retry,
            firsttime_accept_fail: accept,
            ..Config::default()
        };
        ReconnectPolicy::from_config(&config)
    }

    fn not_found() -> PedlError {
        PedlError::DeviceNotFound("test".into())
    }

    #[test]
    fn test_policy_from_config() {
        let p = policy(0.0, 2.5, false);
        assert_eq!(p.reconnect_period, None);
        assert_eq!(p.firsttime_retry, Some(Duration::from_millis(2500)));
        assert_eq!(policy(-1.0, f64::NAN, true).firsttime_retry, None);
    }

    #[test]
    fn test_first_search_retries() {
        let mut manager = ConnectionManager::new(policy(1.0, 0.5, false), DEFAULT_WATCHDOG);
        let now = Instant::now();
        assert!(manager.should_search(now));
        manager.on_search_failed(now, not_found()).unwrap();
        assert!(!manager.should_search(now));
        assert!(manager.should_search(now + Duration::from_millis(500)));
        assert_eq!(manager.state(), ConnectionState::Searching);
    }

    #[test]
    fn test_first_search_strict_is_fatal() {
        let mut manager = ConnectionManager::new(policy(1.0, 0.0, false), DEFAULT_WATCHDOG);
        let err = manager
            .on_search_failed(Instant::now(), not_found())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_first_search_accept_failure() {
        let mut manager = ConnectionManager::new(policy(2.0, 0.0, true), DEFAULT_WATCHDOG);
        let now = Instant::now();
        manager.on_search_failed(now, not_found()).unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.should_search(now + Duration::from_secs(2)));

        let mut parked = ConnectionManager::new(policy(0.0, 0.0, true), DEFAULT_WATCHDOG);
        parked.on_search_failed(now, not_found()).unwrap();
        assert!(!parked.should_search(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_loss_with_zero_period_stops() {
        let mut manager = ConnectionManager::new(policy(0.0, 1.0, false), DEFAULT_WATCHDOG);
        let now = Instant::now();
        assert_eq!(manager.on_connected(now), ConnectKind::First);
        assert_eq!(manager.on_lost(now), LossAction::Stop);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.should_search(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_loss_with_period_searches_every_period() {
        let mut manager = ConnectionManager::new(policy(1.0, 1.0, false), DEFAULT_WATCHDOG);
        let now = Instant::now();
        manager.on_connected(now);
        assert_eq!(manager.on_lost(now), LossAction::Search);
        manager.begin_search();
        assert_eq!(manager.state(), ConnectionState::Searching);
        assert!(manager.should_search(now));

        manager.on_search_failed(now, not_found()).unwrap();
        assert!(!manager.should_search(now + Duration::from_millis(999)));
        assert!(manager.should_search(now + Duration::from_secs(1)));

        assert_eq!(manager.on_connected(now), ConnectKind::Reconnect);
        assert_eq!(manager.connections(), 2);
    }

    #[test]
    fn test_watchdog() {
        let mut manager = ConnectionManager::new(policy(1.0, 1.0, false), Duration::from_secs(10));
        let now = Instant::now();
        assert!(!manager.watchdog_expired(now + Duration::from_secs(60)));
        manager.on_connected(now);
        assert!(!manager.watchdog_expired(now + Duration::from_secs(5)));
        assert!(manager.watchdog_expired(now + Duration::from_secs(11)));
        manager.on_heartbeat(now + Duration::from_secs(9));
        assert!(!manager.watchdog_expired(now + Duration::from_secs(11)));
    }
}
