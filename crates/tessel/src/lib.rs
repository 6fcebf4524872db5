//! Tessel: a tick-driven, partitioned world simulation core for game servers.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Tessel sub-crates. For most users, adding `tessel` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use tessel::prelude::*;
//!
//! let config = ServerConfig {
//!     tick_rate_hz: 50,
//!     worker_threads: Some(2),
//!     ..ServerConfig::default()
//! };
//! let server = ServerProcess::new(config, ServerParts::default()).unwrap();
//!
//! let spawn = RegionCoord::new(0, 0);
//! server.world().load_region(Region::new(spawn));
//! server
//!     .world()
//!     .spawn(ObjectSpec::creature(Vec3::new(8.0, 70.0, 8.0), 20.0));
//!
//! server.start("127.0.0.1:25565".parse().unwrap()).unwrap();
//! assert!(server.is_alive());
//!
//! let report = server.stop();
//! assert!(report.tick_joined);
//! assert!(!server.is_alive());
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tessel-core` | IDs, geometry, error taxonomy |
//! | [`engine`] | `tessel-engine` | Handles, partitions, dispatcher, tick driver, server lifecycle |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identifiers, geometry, and error types (`tessel-core`).
pub use tessel_core as types;

/// The concurrency core (`tessel-engine`).
///
/// [`engine::ServerProcess`] runs the whole thing on a dedicated tick
/// thread; [`engine::TickDriver`] can also be driven tick by tick.
pub use tessel_engine as engine;

/// Common imports for typical Tessel usage.
///
/// ```rust
/// use tessel::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use tessel_core::{ObjectId, PartitionId, RegionCoord, TickId, Vec3, REGION_SIZE};

    // Errors
    pub use tessel_core::{AccessError, FatalError, FaultContext, LifecycleError, SimulationFault};

    // World contents
    pub use tessel_engine::{
        DynamicObject, ObjectBehavior, ObjectHandle, ObjectSpec, ObjectState, Region,
        RegionHandle, UpdateContext, World,
    };

    // Collaborators
    pub use tessel_engine::{
        ExceptionSink, NetworkLayer, TaskOutcome, TaskPhase, TaskQueue, TaskScheduler,
        TickObserver,
    };

    // Lifecycle
    pub use tessel_engine::{
        BuildError, ServerConfig, ServerParts, ServerProcess, ShutdownReport, Snapshot,
        TickDriver,
    };
}
