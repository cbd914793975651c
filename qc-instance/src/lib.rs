//! qc-instance - provisions cloud instances and their elastic IPs against an
//! eventually-consistent control plane.
//!
//! Every remote action returns before the resource settles, so each
//! lifecycle step that mutates remote state is followed by a bounded
//! convergence wait before the next step runs.

pub mod clients;
pub mod config;
pub mod error;
pub mod poller;
pub mod reconciler;
pub mod store;
pub mod sync;

pub use clients::{ClientBundle, EipApi, InstanceApi, SimulatedCloud};
pub use config::{DesiredConfiguration, EngineSettings, ResourceRecord};
pub use error::{Error, Result};
pub use reconciler::{InstanceReconciler, Reconciler};
pub use store::RecordStore;
