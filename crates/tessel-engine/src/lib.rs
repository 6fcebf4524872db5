//! Tick-driven concurrency core for Tessel servers.
//!
//! The world is split into fixed-size [`Region`]s, each holding the
//! [`DynamicObject`]s inside it. Regions are grouped into
//! [`Partition`]s, one per worker thread; every tick the [`TickDriver`]
//! runs a fixed sequence of phases, and in the parallel phase each worker
//! simulates its partition start to finish while the driver waits at a
//! barrier. Membership changes (spawns, removals, migrations, pool
//! resizes) happen only at tick boundaries.
//!
//! Every region and object lives inside a [`SafeHandle`]. The worker that
//! owns a partition reaches its contents without contention; any other
//! thread blocks on the partition gate or backs off with
//! [`SafeHandle::try_access`]. Read-only observers use the
//! [`SnapshotService`], which never blocks a tick.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod collab;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod handle;
pub mod metrics;
pub mod object;
pub mod partition;
pub mod policy;
pub mod region;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod tick;
pub mod world;

pub use clock::{monotonic_nanos, TickClock};
pub use collab::{NetworkLayer, NoopObserver, NullNetwork, TaskScheduler, TickObserver, TracingObserver};
pub use config::{ConfigError, ServerConfig};
pub use context::{TickContext, UpdateContext};
pub use dispatcher::{
    BoundaryReport, Dispatcher, PoolShutdownReport, ResizeReport, SimulationReport, MAX_WORKERS,
};
pub use handle::{AcquireSample, AcquireStats, PartitionGate, Publish, SafeHandle, WorkerToken};
pub use metrics::{TickMetrics, TickMonitor};
pub use object::{
    CreatureState, DynamicObject, ItemStack, ItemState, ObjectBehavior, ObjectHandle, ObjectKind,
    ObjectSpec, ObjectState, ObjectView, ObjectViewKind, Wander,
};
pub use partition::{Migration, Partition, SegmentReport};
pub use policy::{AssignmentPolicy, Locality, RoundRobin};
pub use region::{Region, RegionHandle, RegionView, TerrainEdit};
pub use scheduler::{Task, TaskOutcome, TaskPhase, TaskQueue};
pub use server::{BuildError, ServerParts, ServerProcess, ShutdownReport};
pub use sink::{ExceptionSink, LoggingSink};
pub use snapshot::{Snapshot, SnapshotService, ViewSource};
pub use tick::{DriverState, TickDriver, TickError, TickParts, TickReport};
pub use world::World;
