//! Core types for the Tessel tick engine.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the identifiers, world geometry, and error taxonomy shared by every
//! other crate in the workspace.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod geom;
pub mod id;

pub use error::{
    AccessError, FatalError, FaultContext, FaultPhase, LifecycleError, SimulationFault,
};
pub use geom::{RegionCoord, Vec3, REGION_SIZE};
pub use id::{HandleId, ObjectId, PartitionId, TaskId, TickId, WorkerId};
