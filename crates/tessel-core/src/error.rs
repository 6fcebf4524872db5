//! Error types for the Tessel tick engine.
//!
//! Errors are split by how they propagate:
//!
//! - [`AccessError`]: returned to the caller of a safe-handle access.
//! - [`SimulationFault`]: recoverable. Contained where it happens and
//!   reported to the exception sink together with a [`FaultContext`].
//! - [`FatalError`]: unrecoverable. Propagates to the process boundary
//!   and triggers an orderly shutdown.
//! - [`LifecycleError`]: start/stop state violations, fatal to the call.

use std::error::Error;
use std::fmt;

use crate::geom::RegionCoord;
use crate::id::{HandleId, ObjectId, PartitionId, TickId};

/// Outcome of a failed safe-handle access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// Another thread holds the object; returned only by `try_access`.
    ///
    /// Not a failure: callers are expected to branch on it.
    WouldBlock,
    /// The wrapped object was removed and the handle is dead.
    Invalidated {
        /// The dead handle.
        handle: HandleId,
    },
    /// A thread re-entered the same handle from inside its own access
    /// closure.
    Reentrant {
        /// The handle that was re-entered.
        handle: HandleId,
    },
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "object is held by another thread"),
            Self::Invalidated { handle } => write!(f, "handle {handle} has been invalidated"),
            Self::Reentrant { handle } => {
                write!(f, "handle {handle} re-entered from its own access closure")
            }
        }
    }
}

impl Error for AccessError {}

/// A recoverable failure raised while running one piece of tick work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimulationFault {
    /// A region or object update returned an error.
    Update {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// An update, a scheduled task or a network step panicked; the panic
    /// was caught.
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
    /// Updating required a handle access that failed.
    Access(AccessError),
    /// A scheduled task failed.
    Task {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// Processing inbound connections or input failed for one client.
    Ingest {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl fmt::Display for SimulationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update { reason } => write!(f, "update failed: {reason}"),
            Self::Panicked { message } => write!(f, "panicked: {message}"),
            Self::Access(e) => write!(f, "access failed: {e}"),
            Self::Task { reason } => write!(f, "scheduled task failed: {reason}"),
            Self::Ingest { reason } => write!(f, "ingest failed: {reason}"),
        }
    }
}

impl Error for SimulationFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Access(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AccessError> for SimulationFault {
    fn from(e: AccessError) -> Self {
        Self::Access(e)
    }
}

/// The tick phase a fault was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPhase {
    /// Due scheduled tasks (step 1).
    ScheduledTasks,
    /// Network ingestion (step 2).
    Ingest,
    /// Parallel world simulation (step 3).
    Simulation,
    /// End-of-tick scheduled tasks (step 4).
    EndOfTickTasks,
    /// Boundary synchronization (migrations, spawns, removals).
    Boundary,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ScheduledTasks => "scheduled-tasks",
            Self::Ingest => "ingest",
            Self::Simulation => "simulation",
            Self::EndOfTickTasks => "end-of-tick-tasks",
            Self::Boundary => "boundary",
        };
        f.write_str(name)
    }
}

/// Where a [`SimulationFault`] happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultContext {
    /// Tick during which the fault was raised.
    pub tick: TickId,
    /// Phase of the tick.
    pub phase: FaultPhase,
    /// Partition being simulated, if any.
    pub partition: Option<PartitionId>,
    /// Region being updated, if any.
    pub region: Option<RegionCoord>,
    /// Object being updated, if any.
    pub object: Option<ObjectId>,
}

impl FaultContext {
    /// A context with only tick and phase set.
    pub fn new(tick: TickId, phase: FaultPhase) -> Self {
        Self {
            tick,
            phase,
            partition: None,
            region: None,
            object: None,
        }
    }

    /// Attach a partition.
    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Attach a region.
    pub fn with_region(mut self, region: RegionCoord) -> Self {
        self.region = Some(region);
        self
    }

    /// Attach an object.
    pub fn with_object(mut self, object: ObjectId) -> Self {
        self.object = Some(object);
        self
    }
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick {} ({})", self.tick, self.phase)?;
        if let Some(p) = self.partition {
            write!(f, " partition {p}")?;
        }
        if let Some(r) = self.region {
            write!(f, " region {r}")?;
        }
        if let Some(o) = self.object {
            write!(f, " object {o}")?;
        }
        Ok(())
    }
}

/// An unrecoverable failure. Stops the tick loop and shuts the process down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// The network layer could not bind its listening address.
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying I/O failure.
        reason: String,
    },
    /// Flushing outbound data failed.
    Flush {
        /// Underlying failure.
        reason: String,
    },
    /// The task scheduler hit a fault it cannot recover from.
    Scheduler {
        /// Underlying failure.
        reason: String,
    },
    /// A worker thread exited without reaching the tick barrier.
    WorkerLost {
        /// Partition whose segment never reported back.
        partition: PartitionId,
    },
    /// A background thread could not be spawned.
    ThreadSpawn {
        /// Which thread failed, and why.
        reason: String,
    },
    /// The tick loop itself panicked outside any guarded step.
    TickPanicked {
        /// The panic payload, if it was a string.
        reason: String,
    },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, reason } => write!(f, "cannot bind {addr}: {reason}"),
            Self::Flush { reason } => write!(f, "outbound flush failed: {reason}"),
            Self::Scheduler { reason } => write!(f, "scheduler fault: {reason}"),
            Self::WorkerLost { partition } => {
                write!(f, "worker for partition {partition} exited mid-tick")
            }
            Self::ThreadSpawn { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::TickPanicked { reason } => write!(f, "tick loop panicked: {reason}"),
        }
    }
}

impl Error for FatalError {}

/// Start/stop state violations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start` was called on a process that was already started.
    AlreadyStarted,
    /// A running-only operation was called before `start`.
    NotStarted,
    /// The process or driver has already been stopped.
    Stopped,
    /// Startup failed with a fatal error.
    Fatal(FatalError),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "server already started"),
            Self::NotStarted => write!(f, "server not started"),
            Self::Stopped => write!(f, "server already stopped"),
            Self::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

impl Error for LifecycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FatalError> for LifecycleError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_context_display_includes_location() {
        let ctx = FaultContext::new(TickId(9), FaultPhase::Simulation)
            .with_partition(PartitionId(2))
            .with_region(RegionCoord::new(1, -1))
            .with_object(ObjectId(40));
        assert_eq!(
            ctx.to_string(),
            "tick 9 (simulation) partition 2 region [1, -1] object 40"
        );
    }

    #[test]
    fn access_fault_chains_source() {
        let fault = SimulationFault::from(AccessError::WouldBlock);
        assert!(fault.source().is_some());
        assert!(SimulationFault::Update {
            reason: "x".into()
        }
        .source()
        .is_none());
    }

    #[test]
    fn lifecycle_wraps_fatal() {
        let err = LifecycleError::from(FatalError::Bind {
            addr: "0.0.0.0:1".into(),
            reason: "in use".into(),
        });
        assert_eq!(err.to_string(), "fatal: cannot bind 0.0.0.0:1: in use");
        assert!(err.source().is_some());
    }
}
