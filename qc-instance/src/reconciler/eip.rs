//! EIP association coordinator.
//!
//! Associates an elastic IP with a running instance. The EIP must be out of
//! any transition before the call, and the coordinator waits for it to settle
//! as `associated` afterwards so the next instance read sees the public address.

use tracing::info;

use super::instance::Phase;

use crate::clients::eip::{ASSOCIATED, STABLE};
use crate::clients::{settle, EipApi, EipState, Operation};
use crate::config::PollSettings;
use crate::error::Result;
use crate::poller::{ConvergenceRequest, Observation};

/// Instance/EIP pair being associated. Not persisted; the record carries the
/// resulting `eip_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationLink {
    pub instance_id: String,
    pub eip_id: String,
}

impl AssociationLink {
    pub fn new(instance_id: impl Into<String>, eip_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            eip_id: eip_id.into(),
        }
    }
}

/// Drives one association against the EIP sub-client.
pub struct EipCoordinator<'a> {
    eip: &'a dyn EipApi,
    settings: PollSettings,
}

impl<'a> EipCoordinator<'a> {
    pub fn new(eip: &'a dyn EipApi, settings: PollSettings) -> Self {
        Self { eip, settings }
    }

    async fn await_eip(&self, eip_id: &str, terminal: &[EipState]) -> Result<EipState> {
        let eip = self.eip;
        ConvergenceRequest::new(eip_id, terminal, self.settings)
            .wait(|| async move {
                let desc = settle(eip.describe_eip(eip_id).await, Operation::DescribeEips, eip_id)?;
                Ok(match desc {
                    Some(d) => Observation::Present(d.state()),
                    None => Observation::Vanished,
                })
            })
            .await
    }

    /// Wait until the EIP is out of transition.
    ///
    /// Returns `true` when it is already bound to the link's instance, in
    /// which case the association call must be skipped.
    pub async fn await_ready(&self, link: &AssociationLink) -> Result<bool> {
        let state = self.await_eip(&link.eip_id, STABLE).await?;
        if state != EipState::Associated {
            return Ok(false);
        }
        let desc = settle(
            self.eip.describe_eip(&link.eip_id).await,
            Operation::DescribeEips,
            &link.eip_id,
        )?;
        Ok(desc.is_some_and(|d| d.instance_id == link.instance_id))
    }

    /// Submit the association. A rejection leaves both resources as they were.
    pub async fn associate(&self, link: &AssociationLink) -> Result<()> {
        info!(
            eip_id = %link.eip_id,
            instance_id = %link.instance_id,
            "Associating EIP"
        );
        let result = self
            .eip
            .associate_eip(&link.eip_id, &link.instance_id)
            .await;
        settle(result, Operation::AssociateEip, &link.eip_id)
    }

    /// Wait for the EIP to settle as associated.
    pub async fn await_associated(&self, link: &AssociationLink) -> Result<()> {
        self.await_eip(&link.eip_id, ASSOCIATED).await?;
        Ok(())
    }

    /// Full sub-flow: ready, associate, converged. `on_phase` sees each
    /// phase as it is entered.
    ///
    /// Safe to run again after a partial failure: an EIP already bound to the
    /// instance is left alone.
    pub async fn run<F>(&self, link: &AssociationLink, mut on_phase: F) -> Result<()>
    where
        F: FnMut(Phase) + Send,
    {
        on_phase(Phase::AwaitingEip);
        if self.await_ready(link).await? {
            info!(eip_id = %link.eip_id, instance_id = %link.instance_id, "EIP already associated");
            return Ok(());
        }
        on_phase(Phase::Associating);
        self.associate(link).await?;
        on_phase(Phase::AwaitingEipConverged);
        self.await_associated(link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::sim::Fault;
    use crate::clients::{InstanceApi, Reply, RunInstanceRequest, SimulatedCloud};
    use crate::error::Error;
    use std::time::Duration;

    fn settings() -> PollSettings {
        PollSettings::new(Duration::from_secs(1), 10)
    }

    async fn running_instance(cloud: &SimulatedCloud) -> String {
        let request = RunInstanceRequest {
            image_id: "img-1".into(),
            instance_type: "c1m1".into(),
            vxnets: vec!["vx-1".into()],
            ..Default::default()
        };
        let Ok(Reply::Accepted(id)) = cloud.run_instance(&request).await else {
            panic!("run_instance failed");
        };
        // Zero transition polls: the first describe settles it
        cloud.describe_instance(&id).await.unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_associate_waits_for_associated() {
        let cloud = SimulatedCloud::new(0);
        cloud.add_eip("eip-1", "139.198.0.10").await;
        let id = running_instance(&cloud).await;

        let coordinator = EipCoordinator::new(&cloud, settings());
        let link = AssociationLink::new(&id, "eip-1");
        coordinator.run(&link, |_| {}).await.unwrap();

        let eip = cloud.eip("eip-1").await.unwrap();
        assert_eq!(eip.state(), EipState::Associated);
        assert_eq!(eip.instance_id, id);
        assert_eq!(cloud.calls(Operation::AssociateEip).await, 1);

        let instance = cloud.instance(&id).await.unwrap();
        assert_eq!(instance.eip.unwrap().eip_addr, "139.198.0.10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_associated_skips_call() {
        let cloud = SimulatedCloud::new(0);
        cloud.add_eip("eip-1", "139.198.0.10").await;
        let id = running_instance(&cloud).await;
        let coordinator = EipCoordinator::new(&cloud, settings());
        let link = AssociationLink::new(&id, "eip-1");

        let mut first = Vec::new();
        coordinator.run(&link, |p| first.push(p)).await.unwrap();
        let mut second = Vec::new();
        coordinator.run(&link, |p| second.push(p)).await.unwrap();

        assert_eq!(
            first,
            vec![
                Phase::AwaitingEip,
                Phase::Associating,
                Phase::AwaitingEipConverged
            ]
        );
        assert_eq!(second, vec![Phase::AwaitingEip]);
        assert_eq!(cloud.calls(Operation::AssociateEip).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_surfaces_remote_message() {
        let cloud = SimulatedCloud::new(0);
        cloud.add_eip("eip-1", "139.198.0.10").await;
        let id = running_instance(&cloud).await;
        cloud
            .inject(
                Operation::AssociateEip,
                Fault::Reject {
                    code: 2400,
                    message: "eip bandwidth exceeds quota".into(),
                },
            )
            .await;

        let coordinator = EipCoordinator::new(&cloud, settings());
        let err = coordinator
            .run(&AssociationLink::new(&id, "eip-1"), |_| {})
            .await
            .unwrap_err();

        match err {
            Error::RemoteRejected {
                operation, message, ..
            } => {
                assert_eq!(operation, Operation::AssociateEip);
                assert_eq!(message, "eip bandwidth exceeds quota");
            }
            other => panic!("unexpected error: {other}"),
        }
        let eip = cloud.eip("eip-1").await.unwrap();
        assert_eq!(eip.state(), EipState::Available);
        assert!(cloud.instance(&id).await.unwrap().eip.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_eip_vanishes() {
        let cloud = SimulatedCloud::new(0);
        let id = running_instance(&cloud).await;
        let coordinator = EipCoordinator::new(&cloud, settings());

        let err = coordinator
            .run(&AssociationLink::new(&id, "eip-missing"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceVanished { attempt: 1, .. }));
        assert_eq!(cloud.calls(Operation::AssociateEip).await, 0);
    }
}
