//! In-process control plane with eventually-consistent state.
//!
//! Mutations are accepted immediately and settle only after a number of
//! describe calls, like the real API. Every call is counted per operation and
//! faults can be queued per operation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::eip::EipDescription;
use super::instance::{
    AttributeChanges, EipRef, InstanceDescription, InstanceState, RunInstanceRequest,
    VxnetAttachment,
};
use super::{ApiResult, EipApi, InstanceApi, Operation, Rejection, Reply, TransportError};
use crate::config::{Field, FieldValue, InstanceType};

const CODE_INVALID_PARAMETER: i32 = 1100;
const CODE_RESOURCE_NOT_FOUND: i32 = 2100;
const CODE_INVALID_STATE: i32 = 2400;

/// A fault returned instead of the next call to an operation.
#[derive(Debug, Clone)]
pub enum Fault {
    Reject { code: i32, message: String },
    Transport(String),
}

/// What a resource turns into once its pending polls run out.
#[derive(Debug, Clone)]
enum Settle {
    Instance { status: &'static str },
    EipAssociated { instance_id: String },
}

#[derive(Debug)]
struct Tracked<D> {
    desc: D,
    pending_polls: u32,
    settle: Option<Settle>,
}

#[derive(Debug, Default)]
struct SimState {
    instances: HashMap<String, Tracked<InstanceDescription>>,
    eips: HashMap<String, Tracked<EipDescription>>,
    calls: HashMap<Operation, u32>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    next_host: u32,
}

impl SimState {
    /// Count the call and pop a queued fault, if any.
    fn enter(&mut self, op: Operation) -> Option<Fault> {
        *self.calls.entry(op).or_default() += 1;
        let fault = self.faults.get_mut(&op).and_then(VecDeque::pop_front)?;
        debug!(operation = %op, ?fault, "Injecting fault");
        Some(fault)
    }

    fn allocate_private_ip(&mut self) -> String {
        self.next_host += 1;
        format!("192.168.0.{}", self.next_host + 1)
    }
}

impl Fault {
    fn into_result<T>(self) -> ApiResult<T> {
        match self {
            Fault::Reject { code, message } => Ok(Reply::Rejected(Rejection { code, message })),
            Fault::Transport(message) => Err(TransportError(message)),
        }
    }
}

fn reject<T>(code: i32, message: impl Into<String>) -> ApiResult<T> {
    Ok(Reply::Rejected(Rejection {
        code,
        message: message.into(),
    }))
}

/// Simulated control plane implementing both sub-clients.
#[derive(Debug)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    transition_polls: u32,
}

impl SimulatedCloud {
    /// Resources settle after `transition_polls` describe calls.
    pub fn new(transition_polls: u32) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            transition_polls,
        }
    }

    /// Register an available EIP.
    pub async fn add_eip(&self, eip_id: &str, eip_addr: &str) {
        let mut state = self.state.lock().await;
        state.eips.insert(
            eip_id.to_string(),
            Tracked {
                desc: EipDescription {
                    eip_id: eip_id.to_string(),
                    eip_addr: eip_addr.to_string(),
                    status: "available".to_string(),
                    transition_status: String::new(),
                    instance_id: String::new(),
                },
                pending_polls: 0,
                settle: None,
            },
        );
    }

    /// Queue a fault for the next call to `op`.
    pub async fn inject(&self, op: Operation, fault: Fault) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(fault);
    }

    /// Number of calls made to `op` so far.
    pub async fn calls(&self, op: Operation) -> u32 {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    /// Current description of an instance, without counting as a describe.
    pub async fn instance(&self, id: &str) -> Option<InstanceDescription> {
        let state = self.state.lock().await;
        state.instances.get(id).map(|t| t.desc.clone())
    }

    /// Current description of an EIP, without counting as a describe.
    pub async fn eip(&self, id: &str) -> Option<EipDescription> {
        let state = self.state.lock().await;
        state.eips.get(id).map(|t| t.desc.clone())
    }

    /// Drop an instance entirely, as if the remote side forgot it.
    pub async fn forget_instance(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.instances.remove(id);
    }
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new(2)
    }
}

fn step_instance(state: &mut SimState, id: &str) -> Option<InstanceDescription> {
    let tracked = state.instances.get_mut(id)?;
    if tracked.pending_polls > 0 {
        tracked.pending_polls -= 1;
        return Some(tracked.desc.clone());
    }
    if let Some(Settle::Instance { status }) = tracked.settle.take() {
        tracked.desc.status = status.to_string();
        tracked.desc.transition_status.clear();
    }
    Some(tracked.desc.clone())
}

fn step_eip(state: &mut SimState, id: &str) -> Option<EipDescription> {
    let tracked = state.eips.get_mut(id)?;
    if tracked.pending_polls > 0 {
        tracked.pending_polls -= 1;
        return Some(tracked.desc.clone());
    }
    let settle = tracked.settle.take();
    if let Some(Settle::EipAssociated { instance_id }) = settle {
        tracked.desc.status = "associated".to_string();
        tracked.desc.transition_status.clear();
        tracked.desc.instance_id = instance_id.clone();
        let eip_ref = EipRef {
            eip_id: tracked.desc.eip_id.clone(),
            eip_addr: tracked.desc.eip_addr.clone(),
        };
        let desc = tracked.desc.clone();
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.desc.eip = Some(eip_ref);
        }
        return Some(desc);
    }
    Some(tracked.desc.clone())
}

#[async_trait]
impl InstanceApi for SimulatedCloud {
    async fn run_instance(&self, request: &RunInstanceRequest) -> ApiResult<String> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::RunInstances) {
            return fault.into_result();
        }
        if request.image_id.is_empty() {
            return reject(CODE_INVALID_PARAMETER, "image_id is required");
        }

        let (vcpus, memory) = match request.instance_type.parse::<InstanceType>() {
            Ok(t) => t.sizing(),
            Err(_) => (request.cpu, request.memory),
        };
        let private_ip = state.allocate_private_ip();
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("i-{}", &simple[..8]);

        let desc = InstanceDescription {
            instance_id: id.clone(),
            image_id: request.image_id.clone(),
            instance_type: request.instance_type.clone(),
            instance_class: request.instance_class,
            status: "pending".to_string(),
            vcpus_current: vcpus,
            memory_current: memory,
            vxnets: request
                .vxnets
                .iter()
                .map(|vxnet_id| VxnetAttachment {
                    vxnet_id: vxnet_id.clone(),
                    private_ip: private_ip.clone(),
                })
                .collect(),
            security_group_id: Some(request.security_group.clone())
                .filter(|sg| !sg.is_empty()),
            keypair_ids: request.login_keypair.iter().cloned().collect(),
            ..Default::default()
        };
        debug!(instance_id = %id, "Simulated instance accepted");
        state.instances.insert(
            id.clone(),
            Tracked {
                desc,
                pending_polls: self.transition_polls,
                settle: Some(Settle::Instance { status: "running" }),
            },
        );
        Ok(Reply::Accepted(id))
    }

    async fn describe_instance(&self, id: &str) -> ApiResult<Option<InstanceDescription>> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::DescribeInstances) {
            return fault.into_result();
        }
        Ok(Reply::Accepted(step_instance(&mut state, id)))
    }

    async fn modify_instance_attributes(
        &self,
        id: &str,
        changes: &AttributeChanges,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::ModifyInstanceAttributes) {
            return fault.into_result();
        }
        let Some(tracked) = state.instances.get_mut(id) else {
            return reject(CODE_RESOURCE_NOT_FOUND, format!("resource [{id}] not found"));
        };
        for (field, value) in changes {
            let text = match value {
                FieldValue::Str(s) => s.clone(),
                other => {
                    return reject(
                        CODE_INVALID_PARAMETER,
                        format!("{field} cannot be set to {other:?}"),
                    );
                }
            };
            match field {
                Field::Name => tracked.desc.instance_name = text,
                Field::Description => tracked.desc.description = text,
                other => {
                    return reject(
                        CODE_INVALID_PARAMETER,
                        format!("{other} is not a modifiable attribute"),
                    );
                }
            }
        }
        Ok(Reply::Accepted(()))
    }

    async fn terminate_instance(&self, id: &str) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::TerminateInstances) {
            return fault.into_result();
        }
        let transition_polls = self.transition_polls;
        let Some(tracked) = state.instances.get_mut(id) else {
            return reject(CODE_RESOURCE_NOT_FOUND, format!("resource [{id}] not found"));
        };
        let current = tracked.desc.state();
        if !current.is_stable() {
            return reject(
                CODE_INVALID_STATE,
                format!("instance [{id}] is {current}, cannot terminate"),
            );
        }
        tracked.desc.transition_status = "terminating".to_string();
        tracked.pending_polls = transition_polls;
        tracked.settle = Some(Settle::Instance {
            status: "terminated",
        });
        let eip = tracked.desc.eip.take();

        if let Some(eip) = eip
            && let Some(e) = state.eips.get_mut(&eip.eip_id)
        {
            e.desc.status = "available".to_string();
            e.desc.instance_id.clear();
        }
        Ok(Reply::Accepted(()))
    }
}

#[async_trait]
impl EipApi for SimulatedCloud {
    async fn describe_eip(&self, id: &str) -> ApiResult<Option<EipDescription>> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::DescribeEips) {
            return fault.into_result();
        }
        Ok(Reply::Accepted(step_eip(&mut state, id)))
    }

    async fn associate_eip(&self, eip_id: &str, instance_id: &str) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.enter(Operation::AssociateEip) {
            return fault.into_result();
        }
        let running = state
            .instances
            .get(instance_id)
            .map(|t| t.desc.state() == InstanceState::Running)
            .unwrap_or(false);
        if !running {
            return reject(
                CODE_INVALID_STATE,
                format!("instance [{instance_id}] is not running"),
            );
        }
        let transition_polls = self.transition_polls;
        let Some(tracked) = state.eips.get_mut(eip_id) else {
            return reject(
                CODE_RESOURCE_NOT_FOUND,
                format!("resource [{eip_id}] not found"),
            );
        };
        if tracked.desc.status != "available" || !tracked.desc.transition_status.is_empty() {
            return reject(
                CODE_INVALID_STATE,
                format!("eip [{eip_id}] is {}, cannot associate", tracked.desc.state()),
            );
        }
        tracked.desc.transition_status = "associating".to_string();
        tracked.pending_polls = transition_polls;
        tracked.settle = Some(Settle::EipAssociated {
            instance_id: instance_id.to_string(),
        });
        Ok(Reply::Accepted(()))
    }
}
