//! Instance reconciler - sequences instance lifecycle operations.
//!
//! Create: run → await running → sync attributes → (associate EIP) → read.
//! Delete: await a stable state → terminate → clear the identifier.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::eip::{AssociationLink, EipCoordinator};
use super::Reconciler;
use crate::clients::instance::{RUNNING, STABLE, TERMINATED};
use crate::clients::{settle, ClientBundle, InstanceDescription, InstanceState, Operation, RunInstanceRequest};
use crate::config::{
    value_or_zero, DeleteWait, DesiredConfiguration, EngineSettings, Field, FieldValue,
    PollSettings, ResourceRecord, UnsupportedUpdatePolicy, MUTABLE_FIELDS,
    UNSUPPORTED_UPDATE_FIELDS,
};
use crate::error::{Error, Result, ValidationError};
use crate::poller::{ConvergenceRequest, Observation};
use crate::sync::{AppliedChanges, AttributeSynchronizer};

/// Lifecycle phase of one instance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Absent,
    Creating,
    AwaitingBoot,
    Syncing,
    AwaitingEip,
    Associating,
    AwaitingEipConverged,
    Ready,
    Terminating,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Absent => "absent",
            Phase::Creating => "creating",
            Phase::AwaitingBoot => "awaiting_boot",
            Phase::Syncing => "syncing",
            Phase::AwaitingEip => "awaiting_eip",
            Phase::Associating => "associating",
            Phase::AwaitingEipConverged => "awaiting_eip_converged",
            Phase::Ready => "ready",
            Phase::Terminating => "terminating",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Records and logs phase transitions of one operation.
#[derive(Debug)]
struct PhaseTracker {
    history: Vec<Phase>,
}

impl PhaseTracker {
    fn new(start: Phase) -> Self {
        Self {
            history: vec![start],
        }
    }

    fn current(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Absent)
    }

    fn enter(&mut self, instance_id: &str, phase: Phase) {
        info!(instance_id = %instance_id, from = %self.current(), phase = %phase, "Phase transition");
        self.history.push(phase);
    }

    fn fail(&mut self, instance_id: &str, err: &Error) {
        error!(instance_id = %instance_id, phase = %self.current(), error = %err, "Operation failed");
        self.history.push(Phase::Failed);
    }
}

/// Outcome of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Mutable fields changed on the remote side.
    pub applied: AppliedChanges,
    /// Changed fields this revision cannot apply and skipped.
    pub unsupported: Vec<Field>,
}

/// Path taken by [`Reconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction<U> {
    Created,
    /// The record pointed at an instance the remote side no longer knows.
    Recreated,
    Updated(U),
}

/// Instance lifecycle orchestrator.
pub struct InstanceReconciler {
    clients: ClientBundle,
    settings: EngineSettings,
}

impl InstanceReconciler {
    pub fn new(clients: ClientBundle, settings: EngineSettings) -> Self {
        Self { clients, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn describe(&self, id: &str) -> Result<Option<InstanceDescription>> {
        settle(
            self.clients.instance.describe_instance(id).await,
            Operation::DescribeInstances,
            id,
        )
    }

    async fn await_instance(
        &self,
        id: &str,
        terminal: &[InstanceState],
        settings: PollSettings,
    ) -> Result<InstanceState> {
        ConvergenceRequest::new(id, terminal, settings)
            .wait(|| async move {
                Ok(match self.describe(id).await? {
                    Some(d) => Observation::Present(d.state()),
                    None => Observation::Vanished,
                })
            })
            .await
    }

    async fn create_steps(
        &self,
        desired: &DesiredConfiguration,
        record: &mut ResourceRecord,
        phases: &mut PhaseTracker,
    ) -> Result<()> {
        let request = RunInstanceRequest::from(desired);
        let id = settle(
            self.clients.instance.run_instance(&request).await,
            Operation::RunInstances,
            &desired.image_id,
        )?;
        // Keep the identifier from here on so a failed step can be resumed.
        record.id = id.clone();
        record.state = Some(InstanceState::Pending);
        info!(instance_id = %id, image_id = %desired.image_id, "Instance accepted");

        phases.enter(&id, Phase::AwaitingBoot);
        let state = self
            .await_instance(&id, RUNNING, self.settings.instance_poll)
            .await?;
        record.state = Some(state);

        phases.enter(&id, Phase::Syncing);
        AttributeSynchronizer::new(self.clients.instance.as_ref())
            .diff_and_apply(&id, &desired.to_fields(), &mut record.fields, MUTABLE_FIELDS)
            .await?;

        if !desired.eip_id.is_empty() {
            self.associate_eip(&id, &desired.eip_id, phases).await?;
        }

        self.read(record).await?;
        phases.enter(&id, Phase::Ready);
        Ok(())
    }

    async fn associate_eip(&self, id: &str, eip_id: &str, phases: &mut PhaseTracker) -> Result<()> {
        let link = AssociationLink::new(id, eip_id);
        EipCoordinator::new(self.clients.eip.as_ref(), self.settings.eip_poll)
            .run(&link, |phase| phases.enter(id, phase))
            .await
    }

    /// Finish an association a failed create left undone.
    ///
    /// Only runs when an EIP is declared and none is bound yet. Switching to
    /// a different EIP stays an unsupported change.
    async fn resume_eip(&self, desired: &DesiredConfiguration, record: &mut ResourceRecord) -> Result<()> {
        if desired.eip_id.is_empty() || !record.get_str(Field::EipId).is_empty() {
            return Ok(());
        }
        let id = record.id.clone();
        info!(instance_id = %id, eip_id = %desired.eip_id, "Resuming EIP association");

        let mut phases = PhaseTracker::new(Phase::Syncing);
        let result = self.resume_eip_steps(&id, &desired.eip_id, record, &mut phases).await;
        match &result {
            Ok(()) => phases.enter(&id, Phase::Ready),
            Err(e) => phases.fail(&id, e),
        }
        result
    }

    async fn resume_eip_steps(
        &self,
        id: &str,
        eip_id: &str,
        record: &mut ResourceRecord,
        phases: &mut PhaseTracker,
    ) -> Result<()> {
        // Association needs a running instance; a create may have stopped
        // before boot finished.
        phases.enter(id, Phase::AwaitingBoot);
        self.await_instance(id, RUNNING, self.settings.instance_poll)
            .await?;
        self.associate_eip(id, eip_id, phases).await?;
        self.read(record).await
    }

    async fn delete_steps(&self, record: &mut ResourceRecord, phases: &mut PhaseTracker) -> Result<()> {
        let id = record.id.clone();
        match self.describe(&id).await? {
            Some(d) if !d.state().is_gone() => {}
            _ => {
                return Err(Error::NotFound {
                    operation: Operation::TerminateInstances,
                    id,
                });
            }
        }

        // An instance mid-transition cannot always be terminated directly.
        // It existed at the precheck above, so if it finishes terminating or
        // stops resolving during this wait, it counts as deleted.
        let gone = match self
            .await_instance(&id, STABLE, self.settings.instance_poll)
            .await
        {
            Ok(state) if state.is_gone() => {
                info!(instance_id = %id, %state, "Instance already terminated");
                true
            }
            Ok(_) => false,
            Err(Error::ResourceVanished { .. }) => {
                info!(instance_id = %id, "Instance vanished before termination");
                true
            }
            Err(e) => return Err(e),
        };
        if gone {
            record.clear();
            phases.enter(&id, Phase::Absent);
            return Ok(());
        }

        phases.enter(&id, Phase::Terminating);
        settle(
            self.clients.instance.terminate_instance(&id).await,
            Operation::TerminateInstances,
            &id,
        )?;
        info!(instance_id = %id, "Termination accepted");

        if self.settings.delete_wait == DeleteWait::Terminated {
            match self
                .await_instance(&id, TERMINATED, self.settings.instance_poll)
                .await
            {
                Ok(_) | Err(Error::ResourceVanished { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        record.clear();
        phases.enter(&id, Phase::Absent);
        Ok(())
    }

    fn require_id(record: &ResourceRecord) -> Result<&str> {
        if record.is_created() {
            Ok(&record.id)
        } else {
            Err(ValidationError::MissingIdentifier.into())
        }
    }
}

/// Copy an instance description into the record. Absent sub-records reset
/// their fields to empty.
fn apply_description(record: &mut ResourceRecord, desc: &InstanceDescription) {
    let fields = &mut record.fields;
    fields.insert(Field::Name, desc.instance_name.as_str().into());
    fields.insert(Field::Description, desc.description.as_str().into());
    fields.insert(Field::ImageId, desc.image_id.as_str().into());
    fields.insert(Field::InstanceType, desc.instance_type.as_str().into());
    fields.insert(Field::InstanceClass, desc.instance_class.into());
    fields.insert(Field::Cpu, desc.vcpus_current.into());
    fields.insert(Field::Memory, desc.memory_current.into());

    let (vxnet_id, private_ip) = desc
        .vxnets
        .first()
        .map(|v| (v.vxnet_id.as_str(), v.private_ip.as_str()))
        .unwrap_or_default();
    fields.insert(Field::VxnetId, vxnet_id.into());
    fields.insert(Field::PrivateIp, private_ip.into());

    let (eip_id, public_ip) = desc
        .eip
        .as_ref()
        .map(|e| (e.eip_id.as_str(), e.eip_addr.as_str()))
        .unwrap_or_default();
    fields.insert(Field::EipId, eip_id.into());
    fields.insert(Field::PublicIp, public_ip.into());

    fields.insert(
        Field::SecurityGroupId,
        desc.security_group_id.clone().unwrap_or_default().into(),
    );
    fields.insert(
        Field::KeypairIds,
        FieldValue::Set(desc.keypair_ids.iter().cloned().collect()),
    );

    record.state = Some(desc.state());
}

/// Changed fields that update cannot apply in this revision.
///
/// `cpu` and `memory` only count when declared; a zero means the sizing comes
/// from `instance_type`. Key-pairs compare by the login key alone.
pub fn unsupported_changes(desired: &DesiredConfiguration, observed: &ResourceRecord) -> Vec<Field> {
    let mut wanted = desired.to_fields();
    wanted.insert(
        Field::KeypairIds,
        FieldValue::Set(desired.login_keypair().map(str::to_string).into_iter().collect()),
    );
    UNSUPPORTED_UPDATE_FIELDS
        .iter()
        .copied()
        .filter(|field| {
            let want = value_or_zero(&wanted, *field);
            if matches!(field, Field::Cpu | Field::Memory) && want == field.zero() {
                return false;
            }
            want != value_or_zero(&observed.fields, *field)
        })
        .collect()
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    type Spec = DesiredConfiguration;
    type Record = ResourceRecord;
    type UpdateReport = UpdateReport;

    async fn create(&self, desired: &DesiredConfiguration, record: &mut ResourceRecord) -> Result<()> {
        if record.is_created() {
            return Err(ValidationError::AlreadyCreated(record.id.clone()).into());
        }
        desired.validate()?;
        if desired.keypair_ids.len() > 1 {
            warn!(
                keypairs = ?desired.keypair_ids,
                login_keypair = ?desired.login_keypair(),
                "Only the first keypair is used at creation"
            );
        }
        record.fields.clear();
        record.state = None;

        info!(image_id = %desired.image_id, "Creating instance");
        let mut phases = PhaseTracker::new(Phase::Absent);
        phases.enter(&record.id, Phase::Creating);
        let result = self.create_steps(desired, record, &mut phases).await;
        if let Err(e) = &result {
            phases.fail(&record.id, e);
        }
        result
    }

    async fn read(&self, record: &mut ResourceRecord) -> Result<()> {
        let id = Self::require_id(record)?.to_string();
        match self.describe(&id).await? {
            Some(desc) if !desc.state().is_gone() => {
                apply_description(record, &desc);
                debug!(instance_id = %id, state = %desc.state(), "Instance read");
                Ok(())
            }
            _ => Err(Error::NotFound {
                operation: Operation::DescribeInstances,
                id,
            }),
        }
    }

    async fn update(
        &self,
        desired: &DesiredConfiguration,
        record: &mut ResourceRecord,
    ) -> Result<UpdateReport> {
        let id = Self::require_id(record)?.to_string();
        desired.validate()?;

        let unsupported = unsupported_changes(desired, record);
        if !unsupported.is_empty() {
            match self.settings.unsupported_updates {
                UnsupportedUpdatePolicy::Reject => {
                    return Err(Error::UnsupportedChange {
                        id,
                        fields: unsupported,
                    });
                }
                UnsupportedUpdatePolicy::Ignore => {
                    warn!(
                        instance_id = %id,
                        fields = ?unsupported,
                        "Changes to these fields are not supported on update, skipping"
                    );
                }
            }
        }

        let applied = AttributeSynchronizer::new(self.clients.instance.as_ref())
            .diff_and_apply(&id, &desired.to_fields(), &mut record.fields, MUTABLE_FIELDS)
            .await?;

        self.read(record).await?;
        Ok(UpdateReport {
            applied,
            unsupported,
        })
    }

    /// Termination counts as done once the remote side accepts it, unless
    /// [`DeleteWait::Terminated`] is configured.
    async fn delete(&self, record: &mut ResourceRecord) -> Result<()> {
        Self::require_id(record)?;
        let mut phases = PhaseTracker::new(Phase::Ready);
        let result = self.delete_steps(record, &mut phases).await;
        if let Err(e) = &result {
            if !matches!(e, Error::NotFound { .. }) {
                phases.fail(&record.id, e);
            }
        }
        result
    }

    async fn reconcile(
        &self,
        desired: &DesiredConfiguration,
        record: &mut ResourceRecord,
    ) -> Result<ReconcileAction<UpdateReport>> {
        if !record.is_created() {
            self.create(desired, record).await?;
            return Ok(ReconcileAction::Created);
        }

        match self.read(record).await {
            Ok(()) => {
                desired.validate()?;
                self.resume_eip(desired, record).await?;
                Ok(ReconcileAction::Updated(self.update(desired, record).await?))
            }
            Err(Error::NotFound { id, .. }) => {
                warn!(instance_id = %id, "Instance no longer exists, recreating");
                record.clear();
                self.create(desired, record).await?;
                Ok(ReconcileAction::Recreated)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::instance::{EipRef, VxnetAttachment};

    fn desired() -> DesiredConfiguration {
        DesiredConfiguration {
            name: "web".into(),
            image_id: "img-1".into(),
            vxnet_id: "vx-1".into(),
            security_group_id: "sg-1".into(),
            instance_type: "c1m1".into(),
            ..Default::default()
        }
    }

    fn description() -> InstanceDescription {
        InstanceDescription {
            instance_id: "i-1".into(),
            instance_name: "web".into(),
            image_id: "img-1".into(),
            instance_type: "c1m1".into(),
            status: "running".into(),
            vcpus_current: 1,
            memory_current: 1024,
            vxnets: vec![VxnetAttachment {
                vxnet_id: "vx-1".into(),
                private_ip: "192.168.0.2".into(),
            }],
            security_group_id: Some("sg-1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_description_without_eip() {
        let mut record = ResourceRecord::new();
        record.id = "i-1".into();
        apply_description(&mut record, &description());

        assert_eq!(record.get_str(Field::PublicIp), "");
        assert_eq!(record.get_str(Field::EipId), "");
        assert_eq!(record.get_str(Field::PrivateIp), "192.168.0.2");
        assert_eq!(record.state, Some(InstanceState::Running));
    }

    #[test]
    fn test_apply_description_resets_missing_sub_records() {
        let mut record = ResourceRecord::new();
        let mut desc = description();
        desc.eip = Some(EipRef {
            eip_id: "eip-1".into(),
            eip_addr: "139.198.0.10".into(),
        });
        apply_description(&mut record, &desc);
        assert_eq!(record.get_str(Field::PublicIp), "139.198.0.10");

        desc.eip = None;
        desc.vxnets.clear();
        apply_description(&mut record, &desc);
        assert_eq!(record.get_str(Field::PublicIp), "");
        assert_eq!(record.get_str(Field::VxnetId), "");
        assert_eq!(record.get_str(Field::PrivateIp), "");
    }

    #[test]
    fn test_unsupported_changes_detected() {
        let mut record = ResourceRecord::new();
        apply_description(&mut record, &description());

        assert!(unsupported_changes(&desired(), &record).is_empty());

        let mut changed = desired();
        changed.vxnet_id = "vx-2".into();
        changed.security_group_id = "sg-2".into();
        changed.keypair_ids.insert("kp-1".into());
        assert_eq!(
            unsupported_changes(&changed, &record),
            vec![Field::VxnetId, Field::SecurityGroupId, Field::KeypairIds]
        );
    }

    #[test]
    fn test_creation_only_changes_are_not_unsupported() {
        let mut record = ResourceRecord::new();
        apply_description(&mut record, &description());

        let mut changed = desired();
        changed.image_id = "img-2".into();
        changed.hostname = "web-01".into();
        changed.instance_class = 1;
        assert!(unsupported_changes(&changed, &record).is_empty());
    }

    #[test]
    fn test_only_login_keypair_is_compared() {
        let mut record = ResourceRecord::new();
        let mut desc = description();
        desc.keypair_ids = vec!["kp-a".into()];
        apply_description(&mut record, &desc);

        let mut changed = desired();
        changed.keypair_ids = ["kp-a".to_string(), "kp-b".to_string()].into();
        assert!(unsupported_changes(&changed, &record).is_empty());

        changed.keypair_ids = ["kp-0".to_string(), "kp-a".to_string()].into();
        assert_eq!(unsupported_changes(&changed, &record), vec![Field::KeypairIds]);
    }

    #[test]
    fn test_declared_sizing_counts_as_change() {
        let mut record = ResourceRecord::new();
        apply_description(&mut record, &description());

        let mut changed = desired();
        changed.cpu = 2;
        assert_eq!(unsupported_changes(&changed, &record), vec![Field::Cpu]);
    }

    #[test]
    fn test_phase_tracker_history() {
        let mut phases = PhaseTracker::new(Phase::Absent);
        phases.enter("i-1", Phase::Creating);
        phases.fail(
            "i-1",
            &Error::ResourceVanished {
                id: "i-1".into(),
                attempt: 1,
            },
        );
        assert_eq!(
            phases.history,
            vec![Phase::Absent, Phase::Creating, Phase::Failed]
        );
    }
}
