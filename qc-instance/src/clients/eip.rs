//! Elastic IP API types.

use std::fmt;

/// EIP state as observed on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EipState {
    Pending,
    Available,
    Associated,
    Suspended,
    Released,
    Ceased,
    /// Any non-empty `transition_status` (associating, dissociating, ...).
    Transitioning,
}

impl EipState {
    pub fn from_remote(status: &str, transition_status: &str) -> Self {
        if !transition_status.is_empty() {
            return EipState::Transitioning;
        }
        match status {
            "available" => EipState::Available,
            "associated" => EipState::Associated,
            "suspended" => EipState::Suspended,
            "released" => EipState::Released,
            "ceased" => EipState::Ceased,
            _ => EipState::Pending,
        }
    }

    pub fn is_stable(&self) -> bool {
        !matches!(self, EipState::Pending | EipState::Transitioning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EipState::Pending => "pending",
            EipState::Available => "available",
            EipState::Associated => "associated",
            EipState::Suspended => "suspended",
            EipState::Released => "released",
            EipState::Ceased => "ceased",
            EipState::Transitioning => "transitioning",
        }
    }
}

impl fmt::Display for EipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States in which the EIP is not mid-transition.
pub const STABLE: &[EipState] = &[
    EipState::Available,
    EipState::Associated,
    EipState::Suspended,
    EipState::Released,
    EipState::Ceased,
];

/// State an EIP settles in after a successful association.
pub const ASSOCIATED: &[EipState] = &[EipState::Associated];

/// Observed state of one EIP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EipDescription {
    pub eip_id: String,
    pub eip_addr: String,
    pub status: String,
    pub transition_status: String,
    /// Instance the EIP is bound to, empty if none.
    pub instance_id: String,
}

impl EipDescription {
    pub fn state(&self) -> EipState {
        EipState::from_remote(&self.status, &self.transition_status)
    }
}
