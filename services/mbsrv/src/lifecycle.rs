//! Driver lifecycle manager
//!
//! Owns the register store and point map for the whole process and starts,
//! stops and restarts the Modbus TCP server around them. State machine:
//!
//! ```text
//! Stopped ─► Starting ─► Running ─► Stopping ─► Stopped
//!                ▲          │
//!                └─ Restarting
//! ```
//!
//! An optional watchdog restarts the server when its accept loop exits
//! without a requested stop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{ConfigError, LifecycleError};
use crate::facade::Facade;
use crate::handler::TransactionHandler;
use crate::point_map::PointMap;
use crate::server::{ClientSnapshot, ClientStats, ModbusServer, RunningServer, ServerSettings};
use crate::store::RegisterStore;

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

#[derive(Debug, Default)]
struct Counters {
    starts: AtomicU64,
    stops: AtomicU64,
    restarts: AtomicU64,
    errors: AtomicU64,
}

/// Lifecycle counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub starts: u64,
    pub stops: u64,
    pub restarts: u64,
    pub errors: u64,
}

/// Snapshot returned by [`DriverManager::status`]
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub state: DriverState,
    pub running: bool,
    pub uptime_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub listen_addr: Option<String>,
    pub stats: DriverStats,
    pub clients: Vec<ClientSnapshot>,
    pub active_connections: u32,
    pub points: usize,
    pub debug: bool,
    pub log_level: String,
}

/// Owner of the register memory and the Modbus server
pub struct DriverManager {
    config: AppConfig,
    store: Arc<RegisterStore>,
    handler: Arc<TransactionHandler>,
    clients: Arc<ClientStats>,
    facade: Facade,
    /// Serializes start/stop/restart/watchdog
    server: Mutex<Option<RunningServer>>,
    state: RwLock<DriverState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    counters: Counters,
    manual_stop: AtomicBool,
    debug: AtomicBool,
    watchdog: parking_lot::Mutex<Option<CancellationToken>>,
}

impl DriverManager {
    /// Build the store and point map; an invalid point map is fatal
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let points = PointMap::load(&config.points, &config.memory)?;
        let store = Arc::new(RegisterStore::new(&config.memory));
        let points = Arc::new(ArcSwap::from_pointee(points));
        let facade = Facade::new(store.clone(), points, config.policy.clone());

        info!(
            "Driver created: {} points, holding registers={}",
            facade.point_count(),
            config.memory.holding_registers
        );

        Ok(Self {
            handler: Arc::new(TransactionHandler::new(store.clone())),
            store,
            clients: Arc::new(ClientStats::new()),
            facade,
            server: Mutex::new(None),
            state: RwLock::new(DriverState::Stopped),
            started_at: RwLock::new(None),
            listen_addr: RwLock::new(None),
            counters: Counters::default(),
            // Nothing to supervise until the first start
            manual_stop: AtomicBool::new(true),
            debug: AtomicBool::new(false),
            watchdog: parking_lot::Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    /// Current state; `Stopped` once the accept loop has exited on its own
    pub fn state(&self) -> DriverState {
        let state = *self.state.read();
        if state == DriverState::Running && self.server_exited() {
            DriverState::Stopped
        } else {
            state
        }
    }

    /// Address the server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.server_exited() {
            return None;
        }
        *self.listen_addr.read()
    }

    /// Accept loop gone without a stop. A held lock means a transition is in
    /// progress and the stored state is authoritative.
    fn server_exited(&self) -> bool {
        self.server
            .try_lock()
            .is_ok_and(|slot| slot.as_ref().is_some_and(|s| s.is_finished()))
    }

    fn set_state(&self, state: DriverState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Driver state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    // ========================================================================
    // Internal transitions (caller holds the server lock)
    // ========================================================================

    async fn launch(&self, slot: &mut Option<RunningServer>) -> Result<(), LifecycleError> {
        self.set_state(DriverState::Starting);
        let bound = match self.config.server.socket_addr() {
            Ok(addr) => {
                ModbusServer::bind(
                    addr,
                    self.handler.clone(),
                    self.clients.clone(),
                    ServerSettings::from(&self.config.server),
                )
                .await
            },
            Err(e) => Err(LifecycleError::Address(e.to_string())),
        };

        match bound {
            Ok(server) => {
                let running = server.spawn();
                *self.listen_addr.write() = Some(running.local_addr);
                *self.started_at.write() = Some(Utc::now());
                *slot = Some(running);
                self.set_state(DriverState::Running);
                Ok(())
            },
            Err(e) => {
                error!("Driver start failed: {}", e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.set_state(DriverState::Stopped);
                Err(e)
            },
        }
    }

    async fn halt(&self, slot: &mut Option<RunningServer>) {
        if let Some(server) = slot.take() {
            self.set_state(DriverState::Stopping);
            if let Err(e) = server.stop().await {
                warn!("Server exited with error: {}", e);
            }
        }
        *self.listen_addr.write() = None;
        *self.started_at.write() = None;
        self.set_state(DriverState::Stopped);
    }

    // ========================================================================
    // Public lifecycle surface
    // ========================================================================

    /// Start serving; a no-op when already running
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut server = self.server.lock().await;
        self.manual_stop.store(false, Ordering::SeqCst);

        if server.as_ref().is_some_and(|s| !s.is_finished()) {
            debug!("Driver already running");
            return Ok(());
        }
        // Collect an accept loop that died on its own
        self.halt(&mut server).await;

        self.launch(&mut server).await?;
        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        info!("Driver started");
        Ok(())
    }

    /// Stop serving; a no-op when already stopped
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.manual_stop.store(true, Ordering::SeqCst);
        let mut server = self.server.lock().await;
        if server.is_none() {
            self.set_state(DriverState::Stopped);
            return Ok(());
        }
        self.halt(&mut server).await;
        self.counters.stops.fetch_add(1, Ordering::Relaxed);
        info!("Driver stopped");
        Ok(())
    }

    /// Stop then start; register memory is kept unless `reset_on_restart`
    pub async fn restart(&self) -> Result<(), LifecycleError> {
        let mut server = self.server.lock().await;
        self.manual_stop.store(false, Ordering::SeqCst);
        self.set_state(DriverState::Restarting);
        self.halt(&mut server).await;

        if self.config.lifecycle.reset_on_restart {
            self.store.reset();
            info!("Register memory reset on restart");
        }

        self.launch(&mut server).await?;
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
        info!("Driver restarted");
        Ok(())
    }

    /// Stop the watchdog and the server
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        if let Some(token) = self.watchdog.lock().take() {
            token.cancel();
        }
        self.stop().await
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            starts: self.counters.starts.load(Ordering::Relaxed),
            stops: self.counters.stops.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> DriverStatus {
        let state = self.state();
        let started_at = if state == DriverState::Running {
            *self.started_at.read()
        } else {
            None
        };
        let uptime_secs = started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);

        DriverStatus {
            state,
            running: state == DriverState::Running,
            uptime_secs,
            started_at,
            listen_addr: self.local_addr().map(|a| a.to_string()),
            stats: self.stats(),
            clients: self.clients.snapshot(),
            active_connections: self.clients.active_connections(),
            points: self.facade.point_count(),
            debug: self.debug.load(Ordering::Relaxed),
            log_level: common::logging::get_log_level(),
        }
    }

    // ========================================================================
    // Debug toggle
    // ========================================================================

    /// Switch the process log filter between `debug` and the configured level
    pub fn set_debug(&self, enabled: bool) {
        let changed = if enabled {
            common::logging::set_log_level("debug")
        } else {
            common::logging::reset_log_level()
        };
        if let Err(e) = changed {
            warn!("Log level not changed: {}", e);
        }
        self.debug.store(enabled, Ordering::Relaxed);
        info!("Debug logging {}", if enabled { "on" } else { "off" });
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Watchdog
    // ========================================================================

    /// Spawn the watchdog if enabled; replaces a previous one
    pub fn spawn_watchdog(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let cfg = &self.config.lifecycle.watchdog;
        if !cfg.enabled {
            return None;
        }
        let period = Duration::from_secs(cfg.interval_secs.max(1));
        let token = CancellationToken::new();
        if let Some(previous) = self.watchdog.lock().replace(token.clone()) {
            previous.cancel();
        }
        info!(
            "Watchdog enabled: interval={:?} max_retries={}",
            period, cfg.max_retries
        );
        Some(tokio::spawn(watchdog_loop(
            Arc::downgrade(self),
            period,
            token,
        )))
    }

    /// One supervision pass; `failures` counts consecutive restart attempts
    async fn watchdog_check(&self, failures: &mut u32) -> Result<(), LifecycleError> {
        if self.manual_stop.load(Ordering::SeqCst) {
            *failures = 0;
            return Ok(());
        }

        let mut server = self.server.lock().await;
        if server.as_ref().is_some_and(|s| !s.is_finished()) {
            *failures = 0;
            return Ok(());
        }

        let max = self.config.lifecycle.watchdog.max_retries;
        if max != 0 && *failures >= max {
            return Err(LifecycleError::Watchdog(format!(
                "server still down after {} restart attempts",
                failures
            )));
        }
        *failures += 1;
        warn!(
            "Watchdog: server not running, restart attempt {}",
            failures
        );

        if let Some(dead) = server.take() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = dead.join().await {
                warn!("Server exited with error: {}", e);
            }
        }
        if self.launch(&mut server).await.is_ok() {
            self.counters.restarts.fetch_add(1, Ordering::Relaxed);
            info!("Watchdog restarted the driver");
        }
        Ok(())
    }
}

async fn watchdog_loop(driver: Weak<DriverManager>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {},
        }
        let Some(driver) = driver.upgrade() else {
            break;
        };
        if let Err(e) = driver.watchdog_check(&mut failures).await {
            error!("Watchdog giving up: {}", e);
            break;
        }
    }
    debug!("Watchdog stopped");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::PointConfig;
    use crate::point_map::DataType;
    use crate::store::Table;
    use tracing_test::traced_test;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.server.shutdown_grace_ms = 100;
        config.memory.holding_registers = 200;
        config.points = vec![PointConfig {
            name: "temp1".into(),
            table: Table::HoldingRegisters,
            start_address: 100,
            length: 1,
            data_type: DataType::U16,
        }];
        config
    }

    #[test]
    fn test_new_rejects_invalid_point_map() {
        let mut config = test_config();
        config.points[0].start_address = 200;
        assert!(matches!(
            DriverManager::new(config),
            Err(ConfigError::InvalidPoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let driver = DriverManager::new(test_config()).unwrap();
        assert_eq!(driver.state(), DriverState::Stopped);

        driver.start().await.unwrap();
        let addr = driver.local_addr().unwrap();
        driver.start().await.unwrap();
        assert_eq!(driver.local_addr(), Some(addr));
        assert_eq!(driver.stats().starts, 1);

        let status = driver.status();
        assert!(status.running);
        assert_eq!(status.state, DriverState::Running);
        assert!(status.started_at.is_some());
        assert_eq!(status.points, 1);

        driver.stop().await.unwrap();
        assert_eq!(driver.state(), DriverState::Stopped);
        assert!(driver.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let driver = DriverManager::new(test_config()).unwrap();
        driver.stop().await.unwrap();
        assert_eq!(driver.stats().stops, 0);
        assert_eq!(driver.state(), DriverState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_stopped() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.server.port = occupied.local_addr().unwrap().port();

        let driver = DriverManager::new(config).unwrap();
        let err = driver.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Bind { .. }));
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(driver.stats().errors, 1);
        assert_eq!(driver.stats().starts, 0);
    }

    #[tokio::test]
    async fn test_restart_preserves_memory_by_default() {
        let driver = DriverManager::new(test_config()).unwrap();
        driver.start().await.unwrap();
        driver
            .store()
            .write(Table::HoldingRegisters, 100, &[235])
            .unwrap();

        driver.restart().await.unwrap();
        assert_eq!(driver.state(), DriverState::Running);
        assert_eq!(driver.stats().restarts, 1);
        assert_eq!(
            driver.store().read(Table::HoldingRegisters, 100, 1).unwrap(),
            vec![235]
        );
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_with_reset() {
        let mut config = test_config();
        config.lifecycle.reset_on_restart = true;
        let driver = DriverManager::new(config).unwrap();
        driver.start().await.unwrap();
        driver
            .store()
            .write(Table::HoldingRegisters, 100, &[235])
            .unwrap();

        driver.restart().await.unwrap();
        assert_eq!(
            driver.store().read(Table::HoldingRegisters, 100, 1).unwrap(),
            vec![0]
        );
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_restarts_dead_server() {
        let mut config = test_config();
        config.lifecycle.watchdog.enabled = true;
        let driver = DriverManager::new(config).unwrap();
        driver.start().await.unwrap();

        let mut failures = 0;
        // Healthy: nothing to do
        driver.watchdog_check(&mut failures).await.unwrap();
        assert_eq!(driver.stats().restarts, 0);

        // Kill the accept loop behind the driver's back
        {
            let server = driver.server.lock().await;
            server.as_ref().unwrap().abort();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        driver.watchdog_check(&mut failures).await.unwrap();
        assert_eq!(failures, 1);
        assert_eq!(driver.stats().restarts, 1);
        assert_eq!(driver.state(), DriverState::Running);

        // Next healthy pass clears the streak
        driver.watchdog_check(&mut failures).await.unwrap();
        assert_eq!(failures, 0);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_respects_manual_stop_and_gives_up() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.server.port = occupied.local_addr().unwrap().port();
        config.lifecycle.watchdog.enabled = true;
        config.lifecycle.watchdog.max_retries = 1;
        let driver = DriverManager::new(config).unwrap();

        // Never started: watchdog stays idle
        let mut failures = 0;
        driver.watchdog_check(&mut failures).await.unwrap();
        assert_eq!(failures, 0);

        assert!(driver.start().await.is_err());
        driver.watchdog_check(&mut failures).await.unwrap();
        assert_eq!(failures, 1);
        assert!(matches!(
            driver.watchdog_check(&mut failures).await,
            Err(LifecycleError::Watchdog(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_dead_server_as_stopped() {
        let driver = DriverManager::new(test_config()).unwrap();
        driver.start().await.unwrap();
        let addr = driver.local_addr().unwrap();
        {
            let server = driver.server.lock().await;
            server.as_ref().unwrap().abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = driver.status();
        assert_eq!(status.state, DriverState::Stopped);
        assert!(!status.running);
        assert!(status.listen_addr.is_none());
        assert!(status.started_at.is_none());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        // A plain start brings it back
        driver.start().await.unwrap();
        assert!(driver.status().running);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_watchdog_disabled() {
        let driver = Arc::new(DriverManager::new(test_config()).unwrap());
        assert!(driver.spawn_watchdog().is_none());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_debug_toggle() {
        let driver = DriverManager::new(test_config()).unwrap();
        assert!(!driver.is_debug());
        driver.set_debug(true);
        assert!(driver.is_debug());
        assert!(driver.status().debug);
        assert!(logs_contain("Debug logging on"));
        driver.set_debug(false);
        assert!(!driver.is_debug());
        assert!(logs_contain("Debug logging off"));
        // No reloadable subscriber under test; the toggle still flips
        assert!(logs_contain("Log level not changed"));
    }
}
