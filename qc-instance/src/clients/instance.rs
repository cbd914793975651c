//! Instance API types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{DesiredConfiguration, Fields};

/// Instance state as observed on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopped,
    Suspended,
    Terminated,
    Ceased,
    /// Any non-empty `transition_status` (starting, stopping, terminating, ...).
    Transitioning,
}

impl InstanceState {
    /// Derive the state from the remote `status` and `transition_status` pair.
    pub fn from_remote(status: &str, transition_status: &str) -> Self {
        if !transition_status.is_empty() {
            return InstanceState::Transitioning;
        }
        match status {
            "running" => InstanceState::Running,
            "stopped" => InstanceState::Stopped,
            "suspended" => InstanceState::Suspended,
            "terminated" => InstanceState::Terminated,
            "ceased" => InstanceState::Ceased,
            _ => InstanceState::Pending,
        }
    }

    /// Not mid-transition; safe to act on.
    pub fn is_stable(&self) -> bool {
        !matches!(self, InstanceState::Pending | InstanceState::Transitioning)
    }

    /// Terminated or ceased. The identifier is as good as gone.
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Ceased)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Suspended => "suspended",
            InstanceState::Terminated => "terminated",
            InstanceState::Ceased => "ceased",
            InstanceState::Transitioning => "transitioning",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States the boot wait accepts.
pub const RUNNING: &[InstanceState] = &[InstanceState::Running];

/// States in which the instance is not mid-transition.
pub const STABLE: &[InstanceState] = &[
    InstanceState::Running,
    InstanceState::Stopped,
    InstanceState::Suspended,
    InstanceState::Terminated,
    InstanceState::Ceased,
];

/// States that confirm termination.
pub const TERMINATED: &[InstanceState] = &[InstanceState::Terminated, InstanceState::Ceased];

/// Network attachment of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VxnetAttachment {
    pub vxnet_id: String,
    pub private_ip: String,
}

/// EIP reference embedded in an instance description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EipRef {
    pub eip_id: String,
    pub eip_addr: String,
}

/// Full observed state of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub instance_name: String,
    pub description: String,
    pub image_id: String,
    pub instance_type: String,
    pub instance_class: i64,
    pub status: String,
    pub transition_status: String,
    pub vcpus_current: i64,
    pub memory_current: i64,
    pub vxnets: Vec<VxnetAttachment>,
    pub eip: Option<EipRef>,
    pub security_group_id: Option<String>,
    pub keypair_ids: Vec<String>,
}

impl InstanceDescription {
    pub fn state(&self) -> InstanceState {
        InstanceState::from_remote(&self.status, &self.transition_status)
    }
}

/// Boot request built from a validated desired configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub instance_class: i64,
    pub cpu: i64,
    pub memory: i64,
    pub vxnets: Vec<String>,
    pub security_group: String,
    pub hostname: String,
    pub login_mode: String,
    pub login_keypair: Option<String>,
}

impl From<&DesiredConfiguration> for RunInstanceRequest {
    fn from(desired: &DesiredConfiguration) -> Self {
        let login_keypair = desired.login_keypair().map(str::to_string);
        RunInstanceRequest {
            image_id: desired.image_id.clone(),
            instance_type: desired.instance_type.clone(),
            instance_class: desired.instance_class,
            cpu: desired.cpu,
            memory: desired.memory,
            vxnets: vec![desired.vxnet_id.clone()],
            security_group: desired.security_group_id.clone(),
            hostname: desired.hostname.clone(),
            login_mode: if login_keypair.is_some() {
                "keypair".to_string()
            } else {
                String::new()
            },
            login_keypair,
        }
    }
}

/// One batch of attribute changes for `ModifyInstanceAttributes`.
pub type AttributeChanges = Fields;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_status_wins() {
        assert_eq!(
            InstanceState::from_remote("running", "stopping"),
            InstanceState::Transitioning
        );
        assert_eq!(
            InstanceState::from_remote("running", ""),
            InstanceState::Running
        );
        assert_eq!(
            InstanceState::from_remote("pending", ""),
            InstanceState::Pending
        );
    }

    #[test]
    fn test_stable_states() {
        assert!(STABLE.iter().all(|s| s.is_stable()));
        assert!(!InstanceState::Pending.is_stable());
        assert!(!InstanceState::Transitioning.is_stable());
    }

    #[test]
    fn test_run_request_uses_login_keypair() {
        let mut desired = DesiredConfiguration {
            image_id: "img-1".into(),
            vxnet_id: "vx-1".into(),
            security_group_id: "sg-1".into(),
            ..Default::default()
        };
        let request = RunInstanceRequest::from(&desired);
        assert_eq!(request.login_keypair, None);
        assert!(request.login_mode.is_empty());
        assert_eq!(request.vxnets, vec!["vx-1".to_string()]);

        desired.keypair_ids.insert("kp-1".into());
        let request = RunInstanceRequest::from(&desired);
        assert_eq!(request.login_keypair.as_deref(), Some("kp-1"));
        assert_eq!(request.login_mode, "keypair");
    }
}
