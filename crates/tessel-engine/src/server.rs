//! The server process: start, stop, and the dedicated tick thread.
//!
//! [`ServerProcess`] owns a [`TickDriver`] until [`start`](ServerProcess::start)
//! binds the network layer and moves the driver onto the `tessel-tick`
//! thread. [`stop`](ServerProcess::stop) raises the shutdown flag, wakes
//! the tick thread from its period sleep, and waits for it to run the
//! component shutdown sequence. A fatal tick error, or a panic that
//! escapes the tick loop, runs the same sequence from the tick thread
//! itself.

use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tessel_core::{FatalError, LifecycleError, TickId};

use crate::clock::TickClock;
use crate::collab::{NetworkLayer, NullNetwork, TaskScheduler, TickObserver, TracingObserver};
use crate::config::{ConfigError, ServerConfig};
use crate::dispatcher::{Dispatcher, PoolShutdownReport, MAX_WORKERS};
use crate::handle::lock_recover;
use crate::partition::panic_message;
use crate::policy::{AssignmentPolicy, RoundRobin};
use crate::scheduler::TaskQueue;
use crate::sink::{ExceptionSink, LoggingSink};
use crate::snapshot::{Snapshot, SnapshotService};
use crate::tick::{TickDriver, TickParts};
use crate::world::World;

// ── ServerParts ────────────────────────────────────────────────────

/// Pluggable pieces of a [`ServerProcess`].
pub struct ServerParts {
    /// Scheduled work. Default: an empty [`TaskQueue`].
    pub scheduler: Box<dyn TaskScheduler>,
    /// Connections and output. Default: [`NullNetwork`].
    pub network: Box<dyn NetworkLayer>,
    /// Per-tick telemetry. Default: [`TracingObserver`].
    pub observer: Box<dyn TickObserver>,
    /// Fault reporting. Default: [`LoggingSink`].
    pub sink: Arc<dyn ExceptionSink>,
    /// Region placement. Default: [`RoundRobin`].
    pub policy: Box<dyn AssignmentPolicy>,
}

impl Default for ServerParts {
    fn default() -> Self {
        Self {
            scheduler: Box::new(TaskQueue::new()),
            network: Box::new(NullNetwork::new()),
            observer: Box::new(TracingObserver),
            sink: Arc::new(LoggingSink::new()),
            policy: Box::new(RoundRobin::new()),
        }
    }
}

// ── BuildError ─────────────────────────────────────────────────────

/// Why [`ServerProcess::new`] failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// The configuration did not validate.
    Config(ConfigError),
    /// The worker pool could not be started.
    Fatal(FatalError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Fatal(e) => Some(e),
        }
    }
}

impl From<ConfigError> for BuildError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<FatalError> for BuildError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

// ── ShutdownReport ─────────────────────────────────────────────────

/// Report from [`ServerProcess::stop`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Total time spent in `stop`.
    pub total_ms: u64,
    /// Whether the tick thread was joined.
    pub tick_joined: bool,
    /// Whether the tick thread outlived `stop_timeout_ms` and was left
    /// to finish on its own.
    pub timed_out: bool,
    /// The last tick that started.
    pub last_tick: TickId,
    /// What the component shutdown did.
    pub pool: PoolShutdownReport,
    /// Final snapshot, when `snapshot_on_stop` is set.
    pub snapshot: Option<Snapshot>,
}

// ── ServerProcess ──────────────────────────────────────────────────

/// A running (or runnable) tick server.
///
/// All methods take `&self`, so the process can be shared behind an
/// `Arc` between a control thread and snapshot readers.
pub struct ServerProcess {
    config: ServerConfig,
    world: Arc<World>,
    clock: Arc<TickClock>,
    snapshots: SnapshotService,
    target_threads: Arc<AtomicUsize>,
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
    shutdown_flag: Arc<AtomicBool>,
    last_fatal: Arc<Mutex<Option<FatalError>>>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    driver: Option<TickDriver>,
    tick_thread: Option<JoinHandle<PoolShutdownReport>>,
    finished: bool,
}

// Compile-time assertion: the process is shared across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ServerProcess>();
};

impl ServerProcess {
    /// Validate `config` and build an idle process with its worker pool.
    pub fn new(config: ServerConfig, parts: ServerParts) -> Result<Self, BuildError> {
        config.validate()?;
        let world = Arc::new(World::new());
        let clock = Arc::new(TickClock::new());
        let dispatcher = Dispatcher::new(
            config.resolved_worker_threads(),
            parts.policy,
            Arc::clone(&parts.sink),
        )?;
        let driver = TickDriver::new(TickParts {
            world: Arc::clone(&world),
            dispatcher,
            scheduler: parts.scheduler,
            network: parts.network,
            observer: parts.observer,
            sink: parts.sink,
            clock: Arc::clone(&clock),
            period: config.tick_period(),
            max_catch_up: config.max_tick_catch_up,
        });
        let target_threads = driver.target_threads();
        Ok(Self {
            config,
            world,
            clock,
            snapshots: SnapshotService::new(),
            target_threads,
            started: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            last_fatal: Arc::new(Mutex::new(None)),
            control: Mutex::new(Control {
                driver: Some(driver),
                ..Control::default()
            }),
        })
    }

    /// Bind the network layer on `addr` and start ticking.
    ///
    /// Fails with [`LifecycleError::AlreadyStarted`] on a second call and
    /// [`LifecycleError::Stopped`] after [`stop`](Self::stop). A bind
    /// failure shuts the components down and leaves the process stopped.
    pub fn start(&self, addr: SocketAddr) -> Result<(), LifecycleError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(LifecycleError::Stopped);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LifecycleError::AlreadyStarted);
        }

        let mut control = lock_recover(&self.control);
        let Some(mut driver) = control.driver.take() else {
            return Err(LifecycleError::Stopped);
        };

        if let Err(e) = driver.bind(addr) {
            tracing::error!(%addr, error = %e, "bind failed, server not started");
            driver.shutdown_components();
            control.finished = true;
            self.stopped.store(true, Ordering::Release);
            *lock_recover(&self.last_fatal) = Some(e.clone());
            return Err(LifecycleError::Fatal(e));
        }

        let flag = Arc::clone(&self.shutdown_flag);
        let stopped = Arc::clone(&self.stopped);
        let last_fatal = Arc::clone(&self.last_fatal);
        let spawned = thread::Builder::new()
            .name("tessel-tick".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| driver.run(&flag)))
                    .unwrap_or_else(|payload| {
                        Some(FatalError::TickPanicked {
                            reason: panic_message(payload.as_ref()),
                        })
                    });
                if let Some(e) = outcome {
                    tracing::error!(error = %e, "tick loop stopped on fatal error");
                    *lock_recover(&last_fatal) = Some(e);
                    stopped.store(true, Ordering::Release);
                }
                driver.shutdown_components()
            });
        match spawned {
            Ok(handle) => {
                control.tick_thread = Some(handle);
                tracing::info!(
                    %addr,
                    tick_rate_hz = self.config.tick_rate_hz,
                    "server started"
                );
                Ok(())
            }
            Err(e) => {
                // The driver went down with the closure; its pool is
                // stopped on drop.
                let fatal = FatalError::ThreadSpawn {
                    reason: format!("tessel-tick: {e}"),
                };
                control.finished = true;
                self.stopped.store(true, Ordering::Release);
                *lock_recover(&self.last_fatal) = Some(fatal.clone());
                Err(LifecycleError::Fatal(fatal))
            }
        }
    }

    /// Stop the tick loop and every component. Idempotent.
    ///
    /// Waits up to `stop_timeout_ms` for the tick thread. Components are
    /// shut down in order: scheduler, network, worker pool, partitions.
    pub fn stop(&self) -> ShutdownReport {
        let mut control = lock_recover(&self.control);
        if control.finished && control.tick_thread.is_none() && control.driver.is_none() {
            return ShutdownReport {
                tick_joined: true,
                last_tick: self.clock.tick(),
                ..ShutdownReport::default()
            };
        }
        let start = Instant::now();
        control.finished = true;
        self.stopped.store(true, Ordering::Release);
        self.shutdown_flag.store(true, Ordering::Release);

        let mut report = ShutdownReport {
            tick_joined: true,
            ..ShutdownReport::default()
        };
        if let Some(handle) = control.tick_thread.take() {
            // The loop sleeps with park_timeout; unpark wakes it at once.
            handle.thread().unpark();
            let deadline = Instant::now() + Duration::from_millis(self.config.stop_timeout_ms);
            while !handle.is_finished() && Instant::now() < deadline {
                handle.thread().unpark();
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                match handle.join() {
                    Ok(pool) => report.pool = pool,
                    Err(_) => report.tick_joined = false,
                }
            } else {
                tracing::warn!(
                    timeout_ms = self.config.stop_timeout_ms,
                    "tick thread still running after stop timeout, detaching"
                );
                report.tick_joined = false;
                report.timed_out = true;
            }
        }
        if let Some(mut driver) = control.driver.take() {
            report.pool = driver.shutdown_components();
        }
        drop(control);

        if self.config.snapshot_on_stop {
            report.snapshot = Some(self.snapshot());
        }
        report.last_tick = self.clock.tick();
        report.total_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            last_tick = report.last_tick.0,
            workers_joined = report.pool.workers_joined,
            total_ms = report.total_ms,
            "server stopped"
        );
        report
    }

    /// `true` between a successful [`start`](Self::start) and
    /// [`stop`](Self::stop) or a fatal error.
    pub fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// The world. Regions can be loaded and objects spawned at any time;
    /// changes take effect at the next tick boundary.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// The tick clock.
    pub fn clock(&self) -> &Arc<TickClock> {
        &self.clock
    }

    /// The configuration the process was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Capture the latest published state. Callable from any thread,
    /// including while a tick is in progress.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.capture(self.world.as_ref())
    }

    /// The fatal error that stopped the process, if any.
    pub fn last_fatal(&self) -> Option<FatalError> {
        lock_recover(&self.last_fatal).clone()
    }

    /// Request a worker pool of `threads`; applied at the end of the next
    /// tick that has time to spare.
    pub fn set_worker_threads(&self, threads: usize) {
        self.target_threads
            .store(threads.clamp(1, MAX_WORKERS), Ordering::Relaxed);
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            tick_rate_hz: 200,
            worker_threads: Some(2),
            ..ServerConfig::default()
        }
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig {
            tick_rate_hz: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            ServerProcess::new(config, ServerParts::default()),
            Err(BuildError::Config(ConfigError::InvalidTickRate { value: 0 }))
        ));
    }

    #[test]
    fn build_error_keeps_a_spawn_failure_fatal() {
        let err = BuildError::from(FatalError::ThreadSpawn {
            reason: "tessel-worker-0: out of threads".into(),
        });
        assert!(matches!(err, BuildError::Fatal(FatalError::ThreadSpawn { .. })));
        assert_eq!(
            err.to_string(),
            "fatal: thread spawn failed: tessel-worker-0: out of threads"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn start_twice_fails_and_stop_is_idempotent() {
        let server = ServerProcess::new(fast_config(), ServerParts::default()).unwrap();
        assert!(!server.is_alive());
        server.start(addr()).unwrap();
        assert!(server.is_alive());
        assert_eq!(server.start(addr()), Err(LifecycleError::AlreadyStarted));

        assert!(wait_for(|| server.clock().tick() >= TickId(2)));
        let report = server.stop();
        assert!(report.tick_joined);
        assert_eq!(report.pool.workers_joined, 2);
        assert!(!server.is_alive());

        let again = server.stop();
        assert_eq!(again.pool, PoolShutdownReport::default());
        assert_eq!(server.start(addr()), Err(LifecycleError::Stopped));
    }

    #[test]
    fn stop_before_start_shuts_components_down() {
        let server = ServerProcess::new(fast_config(), ServerParts::default()).unwrap();
        let report = server.stop();
        assert_eq!(report.pool.workers_joined, 2);
        assert_eq!(report.last_tick, TickId(0));
        assert!(!server.is_alive());
    }

    #[test]
    fn snapshot_on_stop_is_captured() {
        let config = ServerConfig {
            snapshot_on_stop: true,
            ..fast_config()
        };
        let server = ServerProcess::new(config, ServerParts::default()).unwrap();
        server
            .world()
            .load_region(crate::region::Region::new(tessel_core::RegionCoord::new(0, 0)));
        server.start(addr()).unwrap();
        assert!(wait_for(|| server.snapshot().region_count() == 1));
        let report = server.stop();
        assert_eq!(report.snapshot.map(|s| s.region_count()), Some(1));
    }
}
