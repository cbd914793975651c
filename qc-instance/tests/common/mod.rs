//! Test helpers for qc-instance integration tests.

use std::sync::Arc;
use std::time::Duration;

use qc_instance::config::{DeleteWait, PollSettings, UnsupportedUpdatePolicy};
use qc_instance::{
    ClientBundle, DesiredConfiguration, EngineSettings, InstanceReconciler, SimulatedCloud,
};

pub const EIP_ADDR: &str = "139.198.0.10";

/// Simulated control plane plus a reconciler bound to it.
pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub reconciler: InstanceReconciler,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(2, settings()).await
    }

    /// `transition_polls` describe calls pass before any mutation settles.
    pub async fn with_settings(transition_polls: u32, settings: EngineSettings) -> Self {
        let cloud = Arc::new(SimulatedCloud::new(transition_polls));
        cloud.add_eip("eip-1", EIP_ADDR).await;
        let reconciler = InstanceReconciler::new(ClientBundle::simulated(cloud.clone()), settings);
        Self { cloud, reconciler }
    }

    /// Another reconciler over the same control plane.
    pub fn reconciler_with(&self, settings: EngineSettings) -> InstanceReconciler {
        InstanceReconciler::new(ClientBundle::simulated(self.cloud.clone()), settings)
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        instance_poll: PollSettings::new(Duration::from_secs(3), 20),
        eip_poll: PollSettings::new(Duration::from_secs(3), 20),
        delete_wait: DeleteWait::Accepted,
        unsupported_updates: UnsupportedUpdatePolicy::Ignore,
    }
}

pub fn desired() -> DesiredConfiguration {
    DesiredConfiguration {
        name: "web".into(),
        image_id: "img-1".into(),
        instance_type: "c1m1".into(),
        vxnet_id: "vx-1".into(),
        security_group_id: "sg-1".into(),
        ..Default::default()
    }
}
