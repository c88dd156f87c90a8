//! The result of one scan: what was discovered, what was read, and what went wrong.
//!
//! A [`ScanSession`] is written only by the discovery engine. [`ScanSession::artifact`] can be
//! called at any point to obtain a consistent snapshot for serialization.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::b524::{self, RegisterOpcode, ReplyStatus};
use crate::groups::Classification;
use crate::schema::context::{self, CircuitContext, ContextualEnum};
use crate::value::{Value, WireType};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Pending,
    GroupDiscovery,
    Classification,
    InstancePresence,
    RegisterScan,
    Finalizing,
    Completed,
    Cancelled,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(<&'static str>::from(self))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupDescriptor {
    pub group: u8,
    pub descriptor_type: f32,
    pub classification: Classification,
    pub name: String,
    /// The descriptor the known-groups table expected, when it differs from the observed one.
    pub expected_descriptor: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceSlot {
    pub group: u8,
    pub instance: u8,
    pub present: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    /// No reply, even after the retry.
    Timeout,
    /// A reply arrived but could not be decoded. The raw bytes are retained.
    DecodeError,
    /// The daemon refused the request with something other than a timeout.
    Rejected,
    /// The read was in flight when the scan was forcibly terminated.
    Interrupted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterRecord {
    pub group: u8,
    pub instance: u8,
    pub register: u16,
    pub opcode: RegisterOpcode,
    /// The value bytes after echo stripping, or the whole reply if the echo was malformed.
    pub raw_bytes: Vec<u8>,
    pub reply_status: Option<u8>,
    pub wire_type: Option<WireType>,
    pub value: Option<Value>,
    pub semantic_name: Option<String>,
    /// The myVaillant name of the register, if a leaf name map was given.
    pub leaf_name: Option<String>,
    pub enum_label: Option<String>,
    /// Set while finalizing for circuit registers whose meaning depends on other registers.
    pub contextual_enum: Option<ContextualEnum>,
    pub status: RecordStatus,
    pub error: Option<String>,
}

impl RegisterRecord {
    pub fn empty(
        group: u8,
        instance: u8,
        register: u16,
        opcode: RegisterOpcode,
        status: RecordStatus,
    ) -> Self {
        Self {
            group,
            instance,
            register,
            opcode,
            raw_bytes: Vec::new(),
            reply_status: None,
            wire_type: None,
            value: None,
            semantic_name: None,
            leaf_name: None,
            enum_label: None,
            contextual_enum: None,
            status,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Decode,
    Rejected,
    MalformedReply,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ErrorEntry {
    pub phase: Phase,
    #[serde(serialize_with = "hex_u8_opt")]
    pub group: Option<u8>,
    #[serde(serialize_with = "hex_u8_opt")]
    pub instance: Option<u8>,
    #[serde(serialize_with = "hex_u16_opt")]
    pub register: Option<u16>,
    pub kind: ErrorKind,
    pub message: String,
}

/// The reply to the bus identification query.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Identity {
    pub manufacturer: u8,
    pub device_id: String,
    pub software: String,
    pub hardware: String,
}

impl Identity {
    /// `<manufacturer> <device id, ascii> <sw:2> <hw:2>`
    pub fn parse(reply: &[u8]) -> Option<Self> {
        let (&manufacturer, rest) = reply.split_first()?;
        let (rest, hw) = rest.split_last_chunk::<2>()?;
        let (id, sw) = rest.split_last_chunk::<2>()?;
        let device_id = id
            .iter()
            .map(|b| char::from(*b))
            .filter(|c| !c.is_ascii_control())
            .collect::<String>()
            .trim()
            .to_string();
        Some(Self {
            manufacturer,
            device_id,
            software: format!("{:02x}{:02x}", sw[0], sw[1]),
            hardware: format!("{:02x}{:02x}", hw[0], hw[1]),
        })
    }
}

/// How a scan that ran through `Finalizing` ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InFlight {
    pub group: u8,
    pub instance: u8,
    pub register: u16,
    pub opcode: RegisterOpcode,
}

#[derive(Debug)]
pub struct ScanSession {
    pub destination: u8,
    pub groups: Vec<GroupDescriptor>,
    pub instances: Vec<InstanceSlot>,
    pub registers: Vec<RegisterRecord>,
    pub errors: Vec<ErrorEntry>,
    pub identity: Option<Identity>,
    pub started_at: jiff::Timestamp,
    pub duration: Option<Duration>,
    pub incomplete: bool,
    pub incomplete_reason: Option<String>,
    phase: Phase,
    in_flight: Option<InFlight>,
    requests: BTreeMap<Phase, u64>,
    started: Instant,
    frozen: bool,
}

impl ScanSession {
    pub fn new(destination: u8) -> Self {
        Self {
            destination,
            groups: Vec::new(),
            instances: Vec::new(),
            registers: Vec::new(),
            errors: Vec::new(),
            identity: None,
            started_at: jiff::Timestamp::now(),
            duration: None,
            incomplete: false,
            incomplete_reason: None,
            phase: Phase::Pending,
            in_flight: None,
            requests: BTreeMap::new(),
            started: Instant::now(),
            frozen: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Advance to `phase`. Phases only ever move forward.
    pub fn enter(&mut self, phase: Phase) {
        assert!(!self.frozen, "session is frozen");
        assert!(phase > self.phase, "phase {phase} entered after {}", self.phase);
        self.phase = phase;
    }

    pub fn count_request(&mut self) {
        *self.requests.entry(self.phase).or_default() += 1;
    }

    pub fn probe_count(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn requests_in(&self, phase: Phase) -> u64 {
        self.requests.get(&phase).copied().unwrap_or(0)
    }

    pub fn set_in_flight(&mut self, in_flight: Option<InFlight>) {
        self.in_flight = in_flight;
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub fn push_record(&mut self, record: RegisterRecord) {
        self.in_flight = None;
        self.registers.push(record);
    }

    pub fn push_error(
        &mut self,
        address: (Option<u8>, Option<u8>, Option<u16>),
        kind: ErrorKind,
        message: String,
    ) {
        let (group, instance, register) = address;
        let phase = self.phase;
        self.errors.push(ErrorEntry { phase, group, instance, register, kind, message });
    }

    pub fn records_for(&self, group: u8, instance: u8) -> impl Iterator<Item = &RegisterRecord> {
        self.registers.iter().filter(move |r| r.group == group && r.instance == instance)
    }

    /// The integral value of a successfully read register.
    fn integer_value(&self, group: u8, instance: u8, register: u16) -> Option<i64> {
        self.registers
            .iter()
            .rev()
            .filter(|r| r.status == RecordStatus::Ok)
            .find(|r| r.group == group && r.instance == instance && r.register == register)
            .and_then(|r| r.value.as_ref())
            .and_then(Value::as_integer)
    }

    /// Resolve the circuit registers whose enum meaning depends on the rest of the system.
    fn annotate_circuits(&mut self) {
        let (group, instance, register) = context::SYSTEM_SCHEMA;
        let system_schema = self.integer_value(group, instance, register);
        let cylinders_present = self.groups.iter().any(|g| g.group == context::CYLINDER_GROUP);
        let annotations = self
            .registers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.group == context::CIRCUIT_GROUP && r.status == RecordStatus::Ok)
            .filter_map(|(index, r)| {
                let raw = r.value.as_ref()?.as_integer()?;
                let circuit = CircuitContext {
                    system_schema,
                    cylinders_present,
                    // Pool sensors are not detected.
                    pool_sensor_present: false,
                    cooling_enabled: self.integer_value(
                        context::CIRCUIT_GROUP,
                        r.instance,
                        context::COOLING_ENABLED,
                    ),
                };
                Some((index, context::resolve(r.register, raw, &circuit)?))
            })
            .collect::<Vec<_>>();
        for (index, annotation) in annotations {
            self.registers[index].contextual_enum = Some(annotation);
        }
    }

    /// Run the `Finalizing` step and freeze the session.
    pub fn finalize(&mut self, outcome: Outcome) {
        self.enter(Phase::Finalizing);
        self.annotate_circuits();
        self.duration = Some(self.started.elapsed());
        match outcome {
            Outcome::Completed => {
                self.incomplete = false;
                self.incomplete_reason = None;
                self.phase = Phase::Completed;
            }
            Outcome::Cancelled { reason } => {
                self.incomplete = true;
                self.incomplete_reason = Some(reason);
                self.phase = Phase::Cancelled;
            }
        }
        self.in_flight = None;
        self.frozen = true;
    }

    /// Freeze the session without waiting for the engine, e.g. on a second termination signal.
    ///
    /// A register read that was in flight is recorded as interrupted.
    pub fn finalize_forced(&mut self, reason: String) {
        if self.frozen {
            return;
        }
        if let Some(f) = self.in_flight.take() {
            let mut record = RegisterRecord::empty(
                f.group,
                f.instance,
                f.register,
                f.opcode,
                RecordStatus::Interrupted,
            );
            record.error = Some("interrupted".to_string());
            self.registers.push(record);
        }
        if self.phase < Phase::Finalizing {
            self.enter(Phase::Finalizing);
        }
        self.annotate_circuits();
        self.duration = Some(self.started.elapsed());
        self.incomplete = true;
        self.incomplete_reason = Some(reason);
        self.phase = Phase::Cancelled;
        self.frozen = true;
    }

    /// A consistent snapshot of the session. A session that has not been finalized yet is
    /// always reported incomplete.
    pub fn artifact(&self) -> Artifact {
        let (incomplete, incomplete_reason) = if self.frozen {
            (self.incomplete, self.incomplete_reason.clone())
        } else {
            let reason = self
                .incomplete_reason
                .clone()
                .unwrap_or_else(|| format!("scan in progress (phase {})", self.phase));
            (true, Some(reason))
        };
        let duration = self.duration.unwrap_or_else(|| self.started.elapsed());
        let meta = Meta {
            tool: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
            destination: hex_u8(self.destination),
            started_at: self.started_at,
            duration_seconds: duration.as_secs_f64(),
            incomplete,
            incomplete_reason,
            phase: self.phase,
            probe_count: self.probe_count(),
            requests: self.requests.clone(),
            identity: self.identity.clone(),
        };

        let mut groups = BTreeMap::new();
        for group in &self.groups {
            let mut instances = BTreeMap::new();
            for slot in self.instances.iter().filter(|s| s.group == group.group) {
                let registers = if slot.present {
                    self.records_for(slot.group, slot.instance)
                        .map(|r| (hex_u16(r.register), RegisterArtifact::from(r)))
                        .collect()
                } else {
                    BTreeMap::new()
                };
                instances.insert(
                    hex_u8(slot.instance),
                    InstanceArtifact { present: slot.present, registers },
                );
            }
            groups.insert(
                hex_u8(group.group),
                GroupArtifact {
                    name: group.name.clone(),
                    descriptor_type: group.descriptor_type,
                    classification: group.classification,
                    expected_descriptor: group.expected_descriptor,
                    instances,
                },
            );
        }
        Artifact { meta, groups, errors: self.errors.clone() }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Artifact {
    pub meta: Meta,
    pub groups: BTreeMap<String, GroupArtifact>,
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, serde::Serialize)]
pub struct Meta {
    pub tool: &'static str,
    pub destination: String,
    pub started_at: jiff::Timestamp,
    pub duration_seconds: f64,
    pub incomplete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<String>,
    pub phase: Phase,
    pub probe_count: u64,
    pub requests: BTreeMap<Phase, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

#[derive(Debug, serde::Serialize)]
pub struct GroupArtifact {
    pub name: String,
    pub descriptor_type: f32,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_descriptor: Option<f32>,
    pub instances: BTreeMap<String, InstanceArtifact>,
}

#[derive(Debug, serde::Serialize)]
pub struct InstanceArtifact {
    pub present: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub registers: BTreeMap<String, RegisterArtifact>,
}

#[derive(Debug, serde::Serialize)]
pub struct RegisterArtifact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub myvaillant_name: Option<String>,
    #[serde(rename = "type")]
    pub wire_type: Option<WireType>,
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_raw_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_resolved_name: Option<String>,
    /// `<raw> (<resolved name>)` for contextually resolved enums.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_display: Option<String>,
    pub raw_hex: String,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tt: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tt_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&RegisterRecord> for RegisterArtifact {
    fn from(r: &RegisterRecord) -> Self {
        let contextual = r.contextual_enum.as_ref();
        let raw = r.value.as_ref().and_then(Value::as_integer);
        Self {
            name: r.semantic_name.clone(),
            myvaillant_name: r.leaf_name.clone(),
            wire_type: r.wire_type,
            value: r.value.clone(),
            enum_label: r.enum_label.clone(),
            enum_raw_name: contextual.map(|c| c.raw_name.clone()),
            enum_resolved_name: contextual.map(|c| c.resolved_name.clone()),
            value_display: contextual
                .zip(raw)
                .map(|(c, raw)| format!("{raw} ({})", c.resolved_name)),
            raw_hex: b524::encode_hex(&r.raw_bytes),
            status: r.status,
            tt: r.reply_status,
            tt_kind: r.reply_status.map(ReplyStatus::describe),
            error: r.error.clone(),
        }
    }
}

pub fn hex_u8(value: u8) -> String {
    format!("0x{value:02x}")
}

pub fn hex_u16(value: u16) -> String {
    format!("0x{value:04x}")
}

fn hex_u8_opt<S: serde::Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&hex_u8(*v)),
        None => serializer.serialize_none(),
    }
}

fn hex_u16_opt<S: serde::Serializer>(
    value: &Option<u16>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&hex_u16(*v)),
        None => serializer.serialize_none(),
    }
}
