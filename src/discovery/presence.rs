//! Instance presence heuristics.
//!
//! Failed probes, `no_data` replies and undecodable values are evidence of absence and are not
//! recorded as errors: most instance slots of a regulator are empty.

use tracing::trace;

use super::{Engine, Error, recoverable};
use crate::b524::{self, RegisterOpcode, RegisterSelector};
use crate::groups::{GENERIC_PRESENCE_PROBES, GroupProfile, PresenceRule};
use crate::session::ScanSession;
use crate::transport::Transport;
use crate::value::{self, Value, WireType};

const HEATING_CIRCUIT_PROBE: u16 = 0x0002;
const ZONE_PROBE: u16 = 0x001C;
const REMOTE_SENSOR_PROBES: [u16; 2] = [0x0007, 0x000F];

/// Judge a heating circuit by its register `0x0002`.
pub fn heating_circuit_present(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Integer(n)) if *n != 0x0000 && *n != 0xFFFF)
}

/// Judge a zone by its register `0x001C`.
pub fn zone_present(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Integer(n)) if *n != 0xFF)
}

/// Judge a remote sensor by one of its registers.
pub fn sensor_present(value: Option<&Value>) -> bool {
    value.is_some_and(|v| !v.is_absent())
}

impl<T: Transport> Engine<T> {
    pub(super) async fn probe_presence(
        &mut self,
        session: &mut ScanSession,
        profile: &GroupProfile,
        instance: u8,
    ) -> Result<bool, Error> {
        let group = profile.group;
        match profile.presence {
            PresenceRule::HeatingCircuit => {
                let register = HEATING_CIRCUIT_PROBE;
                let value = self
                    .probe_value(session, profile.opcode, group, instance, register, WireType::U16)
                    .await?;
                Ok(heating_circuit_present(value.as_ref()))
            }
            PresenceRule::Zone => {
                let register = ZONE_PROBE;
                let value = self
                    .probe_value(session, profile.opcode, group, instance, register, WireType::U8)
                    .await?;
                Ok(zone_present(value.as_ref()))
            }
            PresenceRule::RemoteSensor => {
                for register in REMOTE_SENSOR_PROBES {
                    let value = self
                        .probe_value(
                            session,
                            RegisterOpcode::Remote,
                            group,
                            instance,
                            register,
                            WireType::Float32,
                        )
                        .await?;
                    if sensor_present(value.as_ref()) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PresenceRule::AnyResponse => {
                for register in GENERIC_PRESENCE_PROBES {
                    let reply =
                        self.probe(session, profile.opcode, group, instance, register).await?;
                    if reply.is_some() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PresenceRule::Always => Ok(true),
        }
    }

    /// The value bytes of a register, or `None` if it did not answer with data.
    async fn probe(
        &mut self,
        session: &mut ScanSession,
        opcode: RegisterOpcode,
        group: u8,
        instance: u8,
        register: u16,
    ) -> Result<Option<Vec<u8>>, Error> {
        let selector = RegisterSelector::read(opcode, group, instance, register);
        let reply = self.request(session, &selector.header()).await;
        let reply = match recoverable(reply, session.phase())? {
            Ok(reply) => reply,
            Err(error) => {
                trace!(message = "presence probe failed", group, instance, register, %error);
                return Ok(None);
            }
        };
        let header = self.transport.echo_header(opcode);
        match b524::strip_echo(header, &selector, &reply) {
            Ok(reply) if reply.is_no_data() => Ok(None),
            Ok(reply) => Ok(Some(reply.value.to_vec())),
            Err(error) => {
                trace!(
                    message = "presence probe reply unusable",
                    group,
                    instance,
                    register,
                    %error,
                );
                Ok(None)
            }
        }
    }

    async fn probe_value(
        &mut self,
        session: &mut ScanSession,
        opcode: RegisterOpcode,
        group: u8,
        instance: u8,
        register: u16,
        wire_type: WireType,
    ) -> Result<Option<Value>, Error> {
        let Some(data) = self.probe(session, opcode, group, instance, register).await? else {
            return Ok(None);
        };
        Ok(value::decode(wire_type, &data).ok())
    }
}
