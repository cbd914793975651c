//! Attribute synchronization.
//!
//! Computes the minimal set of mutable-field changes between desired and
//! observed configuration and applies them with one modify call per batch
//! group.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::clients::{settle, AttributeChanges, InstanceApi, Operation};
use crate::config::{BatchGroup, Field, Fields, value_or_zero};
use crate::error::Result;

/// Fields changed by one synchronizer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub fields: Vec<Field>,
    pub calls: usize,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Pending changes, grouped per modify call, in application order.
pub type ChangePlan = BTreeMap<BatchGroup, AttributeChanges>;

/// Applies post-creation attribute changes to one instance.
pub struct AttributeSynchronizer<'a> {
    instance: &'a dyn InstanceApi,
}

impl<'a> AttributeSynchronizer<'a> {
    pub fn new(instance: &'a dyn InstanceApi) -> Self {
        Self { instance }
    }

    /// Semantic difference between `desired` and `observed`, restricted to
    /// `mutable`. Fields absent from `desired` are not managed. Fields absent
    /// from `observed` compare as their zero value.
    pub fn diff(desired: &Fields, observed: &Fields, mutable: &[Field]) -> ChangePlan {
        let mut plan = ChangePlan::new();
        for field in mutable {
            let Some(group) = field.group() else {
                debug!(field = %field, "Field has no modify batch, skipping");
                continue;
            };
            let Some(want) = desired.get(field) else {
                continue;
            };
            if *want != value_or_zero(observed, *field) {
                plan.entry(group).or_default().insert(*field, want.clone());
            }
        }
        plan
    }

    /// Apply the difference, one call per batch group.
    ///
    /// Every accepted batch is written back into `observed` before the next
    /// one is sent, so calling this again with the same `desired` after a
    /// partial failure resumes where it stopped and a fully applied state
    /// issues no calls at all.
    pub async fn diff_and_apply(
        &self,
        id: &str,
        desired: &Fields,
        observed: &mut Fields,
        mutable: &[Field],
    ) -> Result<AppliedChanges> {
        let plan = Self::diff(desired, observed, mutable);
        let mut applied = AppliedChanges::default();

        if plan.is_empty() {
            debug!(instance_id = %id, "Attributes already in sync");
            return Ok(applied);
        }

        for (group, changes) in plan {
            info!(
                instance_id = %id,
                ?group,
                fields = ?changes.keys().collect::<Vec<_>>(),
                "Modifying instance attributes"
            );
            let result = self
                .instance
                .modify_instance_attributes(id, &changes)
                .await;
            settle(result, Operation::ModifyInstanceAttributes, id)?;

            applied.calls += 1;
            applied.fields.extend(changes.keys().copied());
            observed.extend(changes);
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::sim::Fault;
    use crate::clients::{RunInstanceRequest, SimulatedCloud};
    use crate::config::{FieldValue, MUTABLE_FIELDS};
    use crate::error::Error;

    async fn booted(cloud: &SimulatedCloud) -> String {
        let request = RunInstanceRequest {
            image_id: "img-1".into(),
            instance_type: "c1m1".into(),
            vxnets: vec!["vx-1".into()],
            ..Default::default()
        };
        match cloud.run_instance(&request).await.unwrap() {
            crate::clients::Reply::Accepted(id) => id,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    fn fields(pairs: &[(Field, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(f, v)| (*f, FieldValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_diff_is_empty_for_equal_values() {
        let desired = fields(&[(Field::Name, "web"), (Field::Description, "")]);
        let observed = fields(&[(Field::Name, "web")]);
        assert!(AttributeSynchronizer::diff(&desired, &observed, MUTABLE_FIELDS).is_empty());
    }

    #[test]
    fn test_diff_ignores_fields_outside_mutable_set() {
        let desired = fields(&[(Field::Name, "web"), (Field::ImageId, "img-2")]);
        let observed = fields(&[(Field::Name, "web"), (Field::ImageId, "img-1")]);
        assert!(AttributeSynchronizer::diff(&desired, &observed, MUTABLE_FIELDS).is_empty());

        // image_id has no modify batch even when listed as mutable
        assert!(AttributeSynchronizer::diff(&desired, &observed, &[Field::ImageId]).is_empty());
    }

    #[test]
    fn test_diff_batches_name_and_description_together() {
        let desired = fields(&[(Field::Name, "web"), (Field::Description, "frontend")]);
        let plan = AttributeSynchronizer::diff(&desired, &Fields::new(), MUTABLE_FIELDS);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[&BatchGroup::Attributes].len(), 2);
    }

    #[tokio::test]
    async fn test_second_call_issues_no_modify() {
        let cloud = SimulatedCloud::new(0);
        let id = booted(&cloud).await;
        let sync = AttributeSynchronizer::new(&cloud);

        let desired = fields(&[(Field::Name, "web"), (Field::Description, "frontend")]);
        let mut observed = Fields::new();

        let first = sync
            .diff_and_apply(&id, &desired, &mut observed, MUTABLE_FIELDS)
            .await
            .unwrap();
        assert_eq!(first.calls, 1);
        assert_eq!(first.fields, vec![Field::Name, Field::Description]);

        let second = sync
            .diff_and_apply(&id, &desired, &mut observed, MUTABLE_FIELDS)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(second.calls, 0);
        assert_eq!(cloud.calls(Operation::ModifyInstanceAttributes).await, 1);

        let desc = cloud.instance(&id).await.unwrap();
        assert_eq!(desc.instance_name, "web");
        assert_eq!(desc.description, "frontend");
    }

    #[tokio::test]
    async fn test_rejection_leaves_observed_untouched() {
        let cloud = SimulatedCloud::new(0);
        let id = booted(&cloud).await;
        cloud
            .inject(
                Operation::ModifyInstanceAttributes,
                Fault::Reject {
                    code: 1400,
                    message: "instance name too long".into(),
                },
            )
            .await;
        let sync = AttributeSynchronizer::new(&cloud);

        let desired = fields(&[(Field::Name, "web")]);
        let mut observed = Fields::new();
        let err = sync
            .diff_and_apply(&id, &desired, &mut observed, MUTABLE_FIELDS)
            .await
            .unwrap_err();

        match err {
            Error::RemoteRejected { message, .. } => assert_eq!(message, "instance name too long"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(observed.is_empty());

        // Retry with the same pair applies the change once
        let applied = sync
            .diff_and_apply(&id, &desired, &mut observed, MUTABLE_FIELDS)
            .await
            .unwrap();
        assert_eq!(applied.calls, 1);
        assert_eq!(observed.get(&Field::Name), Some(&FieldValue::from("web")));
    }
}
