//! The discovery engine.
//!
//! A scan walks the regulator in four phases:
//!
//! 1. `GroupDiscovery` probes the group directory from `0x00` upwards until the NaN terminator;
//! 2. `Classification` matches the discovered descriptors against the known-groups table;
//! 3. `InstancePresence` decides which instance slots of instanced groups are populated;
//! 4. `RegisterScan` reads every register of every present instance.
//!
//! The engine checks for cancellation before every probe. A cancelled scan still runs through
//! `Finalizing`, so the session can always be turned into an artifact.

mod presence;
mod register;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::b524;
use crate::groups::{Classification, GroupProfile};
use crate::plan::{self, IdSet};
use crate::progress::ProgressEvent;
use crate::schema::Schema;
use crate::session::{
    ErrorKind, GroupDescriptor, Identity, InstanceSlot, Outcome, Phase, ScanSession,
};
use crate::transport::{self, Transport};
use crate::value::{EncodeError, WireType};

pub use register::{WriteReport, build_record};

/// The highest group id the directory is probed for.
pub const LAST_GROUP: u8 = 0xFE;

const IDENTITY_PRIMARY: u8 = 0x07;
const IDENTITY_SECONDARY: u8 = 0x04;

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "discovery::Args")]
pub struct Args {
    /// The eBUS address of the regulator.
    #[arg(long, default_value = "0x15", value_parser = plan::parse_id::<u8>)]
    dst: u8,

    /// How long to wait before retrying a request that timed out.
    #[arg(long, default_value = "1s")]
    retry_backoff: humantime::Duration,

    /// Only scan instances and registers of these groups, e.g. `0-3,0x09`.
    ///
    /// All groups are still discovered and recorded.
    #[arg(long, value_parser = plan::parse_id_set)]
    groups: Option<IdSet>,

    /// Do not scan groups missing from the known-groups table.
    #[arg(long)]
    skip_unknown_groups: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub destination: u8,
    pub retry_backoff: Duration,
    pub groups: Option<IdSet>,
    pub skip_unknown_groups: bool,
}

impl Config {
    pub fn new(destination: u8) -> Self {
        Self {
            destination,
            retry_backoff: Duration::from_secs(1),
            groups: None,
            skip_unknown_groups: false,
        }
    }

    fn wants(&self, profile: &GroupProfile) -> bool {
        if self.skip_unknown_groups && !profile.known {
            return false;
        }
        self.groups.as_ref().is_none_or(|set| set.contains(profile.group))
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            destination: args.dst,
            retry_backoff: *args.retry_backoff,
            groups: args.groups,
            skip_unknown_groups: args.skip_unknown_groups,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the transport failed during {1}")]
    Transport(#[source] transport::Error, Phase),
    #[error("register GG={0:#04x} RR={1:#06x} has no known type, specify one explicitly")]
    UnknownType(u8, u16),
    #[error("could not encode `{1}` as {2}")]
    Encode(#[source] EncodeError, String, WireType),
    #[error("the write request failed")]
    Write(#[source] transport::Error),
    #[error("the write acknowledgement is malformed")]
    WriteAcknowledgement(#[source] b524::ReplyError),
}

/// Separate failures scoped to one request from those that end the scan.
fn recoverable<V>(
    result: Result<V, transport::Error>,
    phase: Phase,
) -> Result<Result<V, transport::Error>, Error> {
    match result {
        Err(e) if !e.is_request_scoped() => Err(Error::Transport(e, phase)),
        r => Ok(r),
    }
}

/// Whether a phase ran to its end or stopped at a cancellation check.
enum Progress {
    Done,
    Cancelled,
}

pub struct Engine<T> {
    transport: T,
    schema: Arc<Schema>,
    config: Config,
    events: broadcast::Sender<ProgressEvent>,
}

impl<T: Transport> Engine<T> {
    pub fn new(
        transport: T,
        schema: Arc<Schema>,
        config: Config,
        events: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self { transport, schema, config, events }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn emit(&self, event: ProgressEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn emit_log(&self, level: tracing::Level, message: String) {
        self.emit(ProgressEvent::Log { level, message });
    }

    /// Send a B524 payload, retrying once after the backoff if it times out.
    async fn request(
        &mut self,
        session: &mut ScanSession,
        payload: &[u8],
    ) -> Result<Vec<u8>, transport::Error> {
        let destination = self.config.destination;
        session.count_request();
        match self.transport.send(destination, payload).await {
            Err(transport::Error::Timeout) => {
                debug!(
                    message = "request timed out, retrying",
                    payload = %b524::encode_hex(payload),
                    backoff = ?self.config.retry_backoff,
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                session.count_request();
                self.transport.send(destination, payload).await
            }
            result => result,
        }
    }

    /// Run a complete scan into `session`.
    ///
    /// Request-scoped failures are recorded in the session. An `Err` is only returned for
    /// failures that make the transport unusable, in which case the session is left
    /// unfinalized.
    pub async fn run(
        &mut self,
        session: &mut ScanSession,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        info!(
            message = "starting scan",
            destination = format_args!("{:#04x}", self.config.destination),
            known_schema_registers = self.schema.len(),
        );
        self.identify(session).await?;
        let outcome = match self.scan(session, cancel).await? {
            Progress::Done => Outcome::Completed,
            Progress::Cancelled => {
                let reason = format!("cancelled during {}", session.phase());
                warn!(message = "scan cancelled", %reason);
                Outcome::Cancelled { reason }
            }
        };
        session.finalize(outcome.clone());
        info!(
            message = "scan finished",
            phase = %session.phase(),
            groups = session.groups.len(),
            registers = session.registers.len(),
            errors = session.errors.len(),
            probes = session.probe_count(),
        );
        Ok(outcome)
    }

    async fn scan(
        &mut self,
        session: &mut ScanSession,
        cancel: &CancellationToken,
    ) -> Result<Progress, Error> {
        if let Progress::Cancelled = self.discover_groups(session, cancel).await? {
            return Ok(Progress::Cancelled);
        }
        let profiles = match self.classify_groups(session, cancel) {
            Some(profiles) => profiles,
            None => return Ok(Progress::Cancelled),
        };
        if let Progress::Cancelled = self.probe_instances(session, &profiles, cancel).await? {
            return Ok(Progress::Cancelled);
        }
        self.scan_registers(session, &profiles, cancel).await
    }

    /// Ask the device to identify itself. Failing to do so is not an error.
    async fn identify(&mut self, session: &mut ScanSession) -> Result<(), Error> {
        session.count_request();
        let reply = self
            .transport
            .send_proto(self.config.destination, IDENTITY_PRIMARY, IDENTITY_SECONDARY, &[])
            .await;
        match recoverable(reply, session.phase())? {
            Ok(reply) => {
                session.identity = Identity::parse(&reply);
                match &session.identity {
                    Some(identity) => info!(
                        message = "device identified",
                        manufacturer = format_args!("{:#04x}", identity.manufacturer),
                        device_id = %identity.device_id,
                        software = %identity.software,
                        hardware = %identity.hardware,
                    ),
                    None => debug!(message = "identity reply too short", reply = ?reply),
                }
            }
            Err(error) => debug!(message = "device did not identify itself", %error),
        }
        Ok(())
    }

    async fn discover_groups(
        &mut self,
        session: &mut ScanSession,
        cancel: &CancellationToken,
    ) -> Result<Progress, Error> {
        session.enter(Phase::GroupDiscovery);
        self.emit(ProgressEvent::PhaseStarted {
            phase: Phase::GroupDiscovery,
            total: usize::from(LAST_GROUP) + 1,
        });
        for group in 0x00..=LAST_GROUP {
            if cancel.is_cancelled() {
                return Ok(Progress::Cancelled);
            }
            self.emit(ProgressEvent::GroupProbed { group });
            let reply = self.request(session, &b524::directory_probe(group)).await;
            let reply = match recoverable(reply, Phase::GroupDiscovery)? {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(message = "directory probe failed", group, %error);
                    let kind = match error {
                        transport::Error::Timeout => ErrorKind::Timeout,
                        _ => ErrorKind::Rejected,
                    };
                    session.push_error((Some(group), None, None), kind, error.to_string());
                    continue;
                }
            };
            let descriptor_type = match b524::parse_directory(&reply) {
                Ok(descriptor_type) => descriptor_type,
                Err(error) => {
                    warn!(message = "malformed directory reply", group, %error);
                    let message = format!("{error} (raw {})", b524::encode_hex(&reply));
                    let address = (Some(group), None, None);
                    session.push_error(address, ErrorKind::MalformedReply, message);
                    continue;
                }
            };
            if descriptor_type.is_nan() {
                info!(message = "reached the end of the group directory", group);
                break;
            }
            if descriptor_type == 0.0 {
                debug!(message = "no group", group);
                continue;
            }
            let profile = GroupProfile::lookup(group);
            info!(message = "found group", group, descriptor_type, name = profile.name);
            session.groups.push(GroupDescriptor {
                group,
                descriptor_type,
                classification: Classification::of(descriptor_type),
                name: profile.name.to_string(),
                expected_descriptor: None,
            });
            self.emit(ProgressEvent::GroupFound {
                group,
                descriptor_type,
                name: profile.name.to_string(),
            });
        }
        self.emit(ProgressEvent::PhaseComplete { phase: Phase::GroupDiscovery });
        Ok(Progress::Done)
    }

    /// Returns the profiles of the groups to scan further, or `None` if cancelled.
    fn classify_groups(
        &mut self,
        session: &mut ScanSession,
        cancel: &CancellationToken,
    ) -> Option<Vec<GroupProfile>> {
        session.enter(Phase::Classification);
        self.emit(ProgressEvent::PhaseStarted {
            phase: Phase::Classification,
            total: session.groups.len(),
        });
        let mut profiles = Vec::new();
        for descriptor in &mut session.groups {
            if cancel.is_cancelled() {
                return None;
            }
            let profile = GroupProfile::lookup(descriptor.group);
            descriptor.classification = Classification::of(descriptor.descriptor_type);
            descriptor.name = profile.name.to_string();
            if let Some(expected) = profile.descriptor {
                if expected != descriptor.descriptor_type {
                    let message = format!(
                        "group {:#04x} ({}) reports descriptor {}, expected {expected}",
                        descriptor.group, profile.name, descriptor.descriptor_type
                    );
                    warn!(
                        message = "descriptor mismatch",
                        group = descriptor.group,
                        detail = %message,
                    );
                    descriptor.expected_descriptor = Some(expected);
                    self.emit_log(tracing::Level::WARN, message);
                }
            }
            if !profile.known {
                info!(
                    message = "group is not in the known-groups table",
                    group = descriptor.group,
                    descriptor_type = descriptor.descriptor_type,
                );
            }
            if self.config.wants(&profile) {
                profiles.push(profile);
            } else {
                debug!(message = "group excluded from the scan", group = descriptor.group);
            }
        }
        self.emit(ProgressEvent::PhaseComplete { phase: Phase::Classification });
        Some(profiles)
    }

    async fn probe_instances(
        &mut self,
        session: &mut ScanSession,
        profiles: &[GroupProfile],
        cancel: &CancellationToken,
    ) -> Result<Progress, Error> {
        session.enter(Phase::InstancePresence);
        let classifications = profiles
            .iter()
            .map(|p| {
                session
                    .groups
                    .iter()
                    .find(|g| g.group == p.group)
                    .map_or(Classification::Unrecognized, |g| g.classification)
            })
            .collect::<Vec<_>>();
        let total = std::iter::zip(profiles, &classifications)
            .filter(|(_, c)| **c == Classification::Instanced)
            .map(|(p, _)| usize::from(p.ii_max) + 1)
            .sum();
        self.emit(ProgressEvent::PhaseStarted { phase: Phase::InstancePresence, total });
        for (profile, classification) in std::iter::zip(profiles, classifications) {
            if classification != Classification::Instanced {
                // One implicit instance.
                session.instances.push(InstanceSlot {
                    group: profile.group,
                    instance: 0x00,
                    present: true,
                });
                continue;
            }
            for instance in 0x00..=profile.ii_max {
                if cancel.is_cancelled() {
                    return Ok(Progress::Cancelled);
                }
                let present = self.probe_presence(session, profile, instance).await?;
                debug!(message = "instance presence", group = profile.group, instance, present);
                session.instances.push(InstanceSlot { group: profile.group, instance, present });
                self.emit(ProgressEvent::InstancePresence {
                    group: profile.group,
                    instance,
                    present,
                });
            }
            let present =
                session.instances.iter().filter(|s| s.group == profile.group && s.present).count();
            info!(message = "probed instances", group = profile.group, present);
        }
        self.emit(ProgressEvent::PhaseComplete { phase: Phase::InstancePresence });
        Ok(Progress::Done)
    }

    async fn scan_registers(
        &mut self,
        session: &mut ScanSession,
        profiles: &[GroupProfile],
        cancel: &CancellationToken,
    ) -> Result<Progress, Error> {
        session.enter(Phase::RegisterScan);
        let mut work = Vec::new();
        for slot in session.instances.iter().filter(|s| s.present) {
            if let Some(profile) = profiles.iter().find(|p| p.group == slot.group) {
                work.push((*profile, slot.instance));
            }
        }
        let total = work.iter().map(|(p, _)| usize::from(p.rr_max) + 1).sum();
        self.emit(ProgressEvent::PhaseStarted { phase: Phase::RegisterScan, total });
        for (profile, instance) in work {
            for register in 0x0000..=profile.rr_max {
                if cancel.is_cancelled() {
                    return Ok(Progress::Cancelled);
                }
                let record = self
                    .read_register(session, profile.opcode, profile.group, instance, register)
                    .await?;
                self.emit(ProgressEvent::RegisterRead {
                    group: profile.group,
                    instance,
                    register,
                    status: record.status,
                });
                session.push_record(record);
            }
            info!(message = "scanned instance", group = profile.group, instance);
        }
        self.emit(ProgressEvent::PhaseComplete { phase: Phase::RegisterScan });
        Ok(Progress::Done)
    }
}
