//! Clients for the remote control plane.
//!
//! The orchestrator talks to two sub-clients:
//! - instances: run, describe, modify, terminate
//! - elastic IPs: describe, associate
//!
//! Both are traits so the transport stays outside this crate. `sim` provides
//! an in-process implementation of both.

pub mod eip;
pub mod instance;
pub mod sim;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;

pub use eip::{EipDescription, EipState};
pub use instance::{
    AttributeChanges, InstanceDescription, InstanceState, RunInstanceRequest, VxnetAttachment,
};
pub use sim::SimulatedCloud;

/// Remote calls, named for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    RunInstances,
    DescribeInstances,
    ModifyInstanceAttributes,
    TerminateInstances,
    DescribeEips,
    AssociateEip,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::RunInstances => "RunInstances",
            Operation::DescribeInstances => "DescribeInstances",
            Operation::ModifyInstanceAttributes => "ModifyInstanceAttributes",
            Operation::TerminateInstances => "TerminateInstances",
            Operation::DescribeEips => "DescribeEips",
            Operation::AssociateEip => "AssociateEip",
        };
        f.write_str(s)
    }
}

/// Structured non-zero status returned by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: i32,
    pub message: String,
}

/// Outcome of a call that reached the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Reply<T> {
    /// Build a reply from the wire convention: `ret_code` 0 means success.
    pub fn from_ret_code(ret_code: i32, message: Option<String>, payload: T) -> Self {
        if ret_code == 0 {
            Reply::Accepted(payload)
        } else {
            Reply::Rejected(Rejection {
                code: ret_code,
                message: message.unwrap_or_default(),
            })
        }
    }

    /// Convert a rejection into [`Error::RemoteRejected`].
    pub fn into_result(self, operation: Operation, id: &str) -> crate::error::Result<T> {
        match self {
            Reply::Accepted(payload) => Ok(payload),
            Reply::Rejected(r) => Err(Error::RemoteRejected {
                operation,
                id: id.to_string(),
                code: r.code,
                message: r.message,
            }),
        }
    }
}

/// The call itself could not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Result of a remote call.
pub type ApiResult<T> = std::result::Result<Reply<T>, TransportError>;

/// Flatten an [`ApiResult`] into the crate error taxonomy.
pub fn settle<T>(result: ApiResult<T>, operation: Operation, id: &str) -> crate::error::Result<T> {
    match result {
        Ok(reply) => reply.into_result(operation, id),
        Err(TransportError(message)) => Err(Error::TransportFailure {
            operation,
            id: id.to_string(),
            message,
        }),
    }
}

/// Instance sub-client.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Submit a boot request. Returns the assigned identifier.
    async fn run_instance(&self, request: &RunInstanceRequest) -> ApiResult<String>;

    /// Observe an instance. `None` when the identifier does not resolve.
    async fn describe_instance(&self, id: &str) -> ApiResult<Option<InstanceDescription>>;

    /// Change one batch of mutable attributes.
    async fn modify_instance_attributes(
        &self,
        id: &str,
        changes: &AttributeChanges,
    ) -> ApiResult<()>;

    /// Submit termination.
    async fn terminate_instance(&self, id: &str) -> ApiResult<()>;
}

/// Elastic IP sub-client.
#[async_trait]
pub trait EipApi: Send + Sync {
    /// Observe an EIP. `None` when the identifier does not resolve.
    async fn describe_eip(&self, id: &str) -> ApiResult<Option<EipDescription>>;

    /// Associate an EIP with an instance.
    async fn associate_eip(&self, eip_id: &str, instance_id: &str) -> ApiResult<()>;
}

/// Strongly typed client bundle handed to the orchestrator.
///
/// The underlying clients are stateless and can be shared across operations
/// on distinct identifiers.
#[derive(Clone)]
pub struct ClientBundle {
    pub instance: Arc<dyn InstanceApi>,
    pub eip: Arc<dyn EipApi>,
}

impl ClientBundle {
    pub fn new(instance: Arc<dyn InstanceApi>, eip: Arc<dyn EipApi>) -> Self {
        Self { instance, eip }
    }

    /// Bundle backed by one simulated control plane.
    pub fn simulated(cloud: Arc<SimulatedCloud>) -> Self {
        Self {
            instance: cloud.clone(),
            eip: cloud,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_code_zero_is_accepted() {
        let reply = Reply::from_ret_code(0, None, "i-1".to_string());
        assert_eq!(reply, Reply::Accepted("i-1".to_string()));
    }

    #[test]
    fn test_rejection_keeps_message_verbatim() {
        let reply: Reply<()> =
            Reply::from_ret_code(1400, Some("PermissionDenied, quota exceeded".into()), ());
        let err = reply
            .into_result(Operation::RunInstances, "img-1")
            .unwrap_err();
        match err {
            Error::RemoteRejected {
                operation,
                id,
                code,
                message,
            } => {
                assert_eq!(operation, Operation::RunInstances);
                assert_eq!(id, "img-1");
                assert_eq!(code, 1400);
                assert_eq!(message, "PermissionDenied, quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_transport_error_maps_to_transport_failure() {
        let result: ApiResult<()> = Err(TransportError("connection reset".into()));
        let err = settle(result, Operation::TerminateInstances, "i-1").unwrap_err();
        assert!(matches!(
            err,
            Error::TransportFailure { operation: Operation::TerminateInstances, .. }
        ));
        assert!(err.to_string().contains("i-1"));
    }
}
