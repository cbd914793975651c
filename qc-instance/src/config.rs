//! Field model, desired configuration, resource records and engine settings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clients::InstanceState;
use crate::error::ValidationError;

/// Every configuration key an instance record can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Description,
    ImageId,
    InstanceType,
    InstanceClass,
    Cpu,
    Memory,
    VxnetId,
    Hostname,
    KeypairIds,
    SecurityGroupId,
    EipId,
    PublicIp,
    PrivateIp,
}

/// Groups of fields the remote API accepts in a single modify call.
///
/// Groups are applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BatchGroup {
    /// `ModifyInstanceAttributes`: display name and description.
    Attributes,
}

/// Fields the synchronizer may change after creation.
pub const MUTABLE_FIELDS: &[Field] = &[Field::Name, Field::Description];

/// Fields whose change on update is detected but not applied in this revision.
pub const UNSUPPORTED_UPDATE_FIELDS: &[Field] = &[
    Field::VxnetId,
    Field::SecurityGroupId,
    Field::EipId,
    Field::KeypairIds,
    Field::InstanceType,
    Field::Cpu,
    Field::Memory,
];

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Description => "description",
            Field::ImageId => "image_id",
            Field::InstanceType => "instance_type",
            Field::InstanceClass => "instance_class",
            Field::Cpu => "cpu",
            Field::Memory => "memory",
            Field::VxnetId => "vxnet_id",
            Field::Hostname => "hostname",
            Field::KeypairIds => "keypair_ids",
            Field::SecurityGroupId => "security_group_id",
            Field::EipId => "eip_id",
            Field::PublicIp => "public_ip",
            Field::PrivateIp => "private_ip",
        }
    }

    /// Fixed at boot time. Changes on update are ignored.
    pub fn is_creation_only(&self) -> bool {
        matches!(
            self,
            Field::ImageId | Field::InstanceClass | Field::Hostname | Field::KeypairIds
        )
    }

    /// Populated from the remote side only, never settable by the caller.
    pub fn is_computed(&self) -> bool {
        matches!(self, Field::PublicIp | Field::PrivateIp)
    }

    /// Modify batch this field belongs to, if it can be modified at all.
    pub fn group(&self) -> Option<BatchGroup> {
        match self {
            Field::Name | Field::Description => Some(BatchGroup::Attributes),
            _ => None,
        }
    }

    /// Value a missing entry compares equal to.
    pub fn zero(&self) -> FieldValue {
        match self {
            Field::InstanceClass | Field::Cpu | Field::Memory => FieldValue::Int(0),
            Field::KeypairIds => FieldValue::Set(BTreeSet::new()),
            _ => FieldValue::Str(String::new()),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field value. Sets compare without regard to insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Set(BTreeSet<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

/// Field name to value mapping.
pub type Fields = BTreeMap<Field, FieldValue>;

/// Look up a field, falling back to its zero value.
pub fn value_or_zero(fields: &Fields, field: Field) -> FieldValue {
    fields.get(&field).cloned().unwrap_or_else(|| field.zero())
}

/// Compute profiles accepted by `instance_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    C1m1,
    C1m2,
    C1m4,
    C2m2,
    C2m4,
    C2m8,
    C4m4,
    C4m8,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::C1m1 => "c1m1",
            InstanceType::C1m2 => "c1m2",
            InstanceType::C1m4 => "c1m4",
            InstanceType::C2m2 => "c2m2",
            InstanceType::C2m4 => "c2m4",
            InstanceType::C2m8 => "c2m8",
            InstanceType::C4m4 => "c4m4",
            InstanceType::C4m8 => "c4m8",
        }
    }

    /// vCPUs and memory (MB) this profile boots with.
    pub fn sizing(&self) -> (i64, i64) {
        match self {
            InstanceType::C1m1 => (1, 1024),
            InstanceType::C1m2 => (1, 2048),
            InstanceType::C1m4 => (1, 4096),
            InstanceType::C2m2 => (2, 2048),
            InstanceType::C2m4 => (2, 4096),
            InstanceType::C2m8 => (2, 8192),
            InstanceType::C4m4 => (4, 4096),
            InstanceType::C4m8 => (4, 8192),
        }
    }
}

impl FromStr for InstanceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c1m1" => Ok(InstanceType::C1m1),
            "c1m2" => Ok(InstanceType::C1m2),
            "c1m4" => Ok(InstanceType::C1m4),
            "c2m2" => Ok(InstanceType::C2m2),
            "c2m4" => Ok(InstanceType::C2m4),
            "c2m8" => Ok(InstanceType::C2m8),
            "c4m4" => Ok(InstanceType::C4m4),
            "c4m8" => Ok(InstanceType::C4m8),
            other => Err(ValidationError::InvalidInstanceType(other.to_string())),
        }
    }
}

/// User-declared configuration of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredConfiguration {
    pub name: String,
    pub description: String,
    pub image_id: String,
    pub instance_type: String,
    pub instance_class: i64,
    pub cpu: i64,
    pub memory: i64,
    pub vxnet_id: String,
    pub hostname: String,
    pub keypair_ids: BTreeSet<String>,
    pub security_group_id: String,
    pub eip_id: String,
}

impl DesiredConfiguration {
    /// Check internal consistency. Runs before any remote call.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            (Field::ImageId, &self.image_id),
            (Field::VxnetId, &self.vxnet_id),
            (Field::SecurityGroupId, &self.security_group_id),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Required(field));
            }
        }

        if !self.instance_type.is_empty() {
            self.instance_type.parse::<InstanceType>()?;
        }

        if !matches!(self.instance_class, 0 | 1) {
            return Err(ValidationError::InvalidInstanceClass(self.instance_class));
        }

        if self.cpu < 0 {
            return Err(ValidationError::Negative(Field::Cpu));
        }
        if self.memory < 0 {
            return Err(ValidationError::Negative(Field::Memory));
        }
        if self.instance_type.is_empty() && (self.cpu == 0 || self.memory == 0) {
            return Err(ValidationError::MissingSizing);
        }

        Ok(())
    }

    /// Key-pair used to log in to the instance.
    ///
    /// The remote API takes a single login key at creation, so only the
    /// first value of `keypair_ids` in sorted order is used. The others are
    /// ignored.
    pub fn login_keypair(&self) -> Option<&str> {
        self.keypair_ids.iter().next().map(String::as_str)
    }

    /// Declared fields as a field map. Computed fields are never included.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(Field::Name, self.name.as_str().into());
        fields.insert(Field::Description, self.description.as_str().into());
        fields.insert(Field::ImageId, self.image_id.as_str().into());
        fields.insert(Field::InstanceType, self.instance_type.as_str().into());
        fields.insert(Field::InstanceClass, self.instance_class.into());
        fields.insert(Field::Cpu, self.cpu.into());
        fields.insert(Field::Memory, self.memory.into());
        fields.insert(Field::VxnetId, self.vxnet_id.as_str().into());
        fields.insert(Field::Hostname, self.hostname.as_str().into());
        fields.insert(
            Field::KeypairIds,
            FieldValue::Set(self.keypair_ids.clone()),
        );
        fields.insert(
            Field::SecurityGroupId,
            self.security_group_id.as_str().into(),
        );
        fields.insert(Field::EipId, self.eip_id.as_str().into());
        fields
    }
}

/// Local view of one instance, persisted between lifecycle operations.
///
/// An empty `id` means no remote resource is currently associated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub fields: Fields,
    pub state: Option<InstanceState>,
}

impl ResourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        !self.id.is_empty()
    }

    /// String value of a field, empty if unset.
    pub fn get_str(&self, field: Field) -> &str {
        self.fields
            .get(&field)
            .and_then(FieldValue::as_str)
            .unwrap_or("")
    }

    /// Forget the remote resource.
    pub fn clear(&mut self) {
        self.id.clear();
        self.state = None;
    }
}

/// Bounds for one convergence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval.is_zero() {
            return Err(ValidationError::InvalidPollSettings(
                "interval must be positive",
            ));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidPollSettings(
                "max_attempts must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 200,
        }
    }
}

/// When Delete considers the instance gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteWait {
    /// As soon as the terminate request is accepted.
    #[default]
    Accepted,
    /// After polling through to `terminated`/`ceased`.
    Terminated,
}

/// What Update does with changes it cannot apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsupportedUpdatePolicy {
    /// Log a warning and leave the field unchanged.
    #[default]
    Ignore,
    /// Fail with `UnsupportedChange` before any remote call.
    Reject,
}

/// Tunables for the lifecycle orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSettings {
    pub instance_poll: PollSettings,
    pub eip_poll: PollSettings,
    pub delete_wait: DeleteWait,
    pub unsupported_updates: UnsupportedUpdatePolicy,
}
