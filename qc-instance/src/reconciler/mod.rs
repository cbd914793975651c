//! Lifecycle reconcilers.
//!
//! A reconciler sequences remote calls for one resource kind and drives the
//! local record toward the remote side's authoritative state.

pub mod eip;
pub mod instance;

use async_trait::async_trait;

use crate::error::Result;

pub use eip::{AssociationLink, EipCoordinator};
pub use instance::{InstanceReconciler, Phase, ReconcileAction, UpdateReport};

/// Trait for resource lifecycle reconcilers.
///
/// Operations on one record must not overlap; callers serialize them per
/// identifier. Operations on distinct records are independent.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired configuration.
    type Spec: Sync;
    /// Local record of the remote resource.
    type Record: Send;
    /// Summary returned by update.
    type UpdateReport: Send;

    /// Create the remote resource and populate the record from it.
    async fn create(&self, spec: &Self::Spec, record: &mut Self::Record) -> Result<()>;

    /// Refresh the record from the remote side.
    async fn read(&self, record: &mut Self::Record) -> Result<()>;

    /// Apply changes that can be made in place.
    async fn update(
        &self,
        spec: &Self::Spec,
        record: &mut Self::Record,
    ) -> Result<Self::UpdateReport>;

    /// Remove the remote resource and clear the record's identifier.
    async fn delete(&self, record: &mut Self::Record) -> Result<()>;

    /// Converge toward `spec`: create when absent, otherwise read and update.
    async fn reconcile(
        &self,
        spec: &Self::Spec,
        record: &mut Self::Record,
    ) -> Result<ReconcileAction<Self::UpdateReport>>;
}
