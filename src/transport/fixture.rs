//! An in-memory transport answering from a JSON fixture.
//!
//! The fixture has the shape of a scan artifact, so an artifact written by `scan` can be
//! replayed offline:
//!
//! ```json
//! {"meta": {"identity_hex": "b5424149303005021704"},
//!  "groups": {"0x02": {"descriptor_type": 1.0,
//!                      "instances": {"0x00": {"registers": {"0x000f": {"raw_hex": "3412"}}}}}}}
//! ```
//!
//! A `null` descriptor marks the directory terminator (NaN). Registers without an entry, and
//! entries recorded with `"status": "timeout"`, time out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::{Error, Transport};
use crate::b524::{self, EchoHeader, Optype, RegisterOpcode, Selector};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("could not read the fixture at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("the fixture is not valid JSON")]
    Json(#[source] serde_json::Error),
    #[error("`{0}` is not a valid {1} id")]
    Key(String, &'static str),
    #[error("register {0} has malformed raw_hex")]
    RawHex(String, #[source] b524::Error),
}

#[derive(serde::Deserialize, Default)]
struct FixtureFile {
    #[serde(default)]
    meta: FixtureMeta,
    #[serde(default)]
    groups: BTreeMap<String, FixtureGroup>,
}

#[derive(serde::Deserialize, Default)]
struct FixtureMeta {
    identity_hex: Option<String>,
}

#[derive(serde::Deserialize)]
struct FixtureGroup {
    descriptor_type: Option<f32>,
    #[serde(default)]
    instances: BTreeMap<String, FixtureInstance>,
}

#[derive(serde::Deserialize)]
struct FixtureInstance {
    #[serde(default)]
    registers: BTreeMap<String, FixtureRegister>,
}

#[derive(serde::Deserialize)]
struct FixtureRegister {
    #[serde(default)]
    raw_hex: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tt: Option<u8>,
}

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    tt: u8,
}

fn parse_key<T: TryFrom<u32>>(key: &str, what: &'static str) -> Result<T, LoadError> {
    let digits = key.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16)
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| LoadError::Key(key.to_string(), what))
}

#[derive(Clone, Debug)]
pub struct FixtureTransport {
    descriptors: BTreeMap<u8, f32>,
    registers: BTreeMap<(u8, u8, u16), Entry>,
    identity: Option<Vec<u8>>,
    local_echo: EchoHeader,
    remote_echo: EchoHeader,
    injected_timeouts: BTreeMap<Vec<u8>, usize>,
    sent: Vec<Vec<u8>>,
}

impl Default for FixtureTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self {
            descriptors: BTreeMap::new(),
            registers: BTreeMap::new(),
            identity: None,
            local_echo: EchoHeader::RequestPrefix(6),
            remote_echo: EchoHeader::RequestPrefix(6),
            injected_timeouts: BTreeMap::new(),
            sent: Vec::new(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, LoadError> {
        let data = tokio::fs::read(path).await.map_err(|e| LoadError::Read(e, path.into()))?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, LoadError> {
        let file: FixtureFile = serde_json::from_slice(data).map_err(LoadError::Json)?;
        let mut fixture = Self::new();
        if let Some(identity) = &file.meta.identity_hex {
            let bytes = b524::decode_hex(identity)
                .map_err(|e| LoadError::RawHex("identity".into(), e))?;
            fixture.identity = Some(bytes);
        }
        for (group_key, group) in &file.groups {
            let gg = parse_key::<u8>(group_key, "group")?;
            fixture.descriptors.insert(gg, group.descriptor_type.unwrap_or(f32::NAN));
            for (instance_key, instance) in &group.instances {
                let ii = parse_key::<u8>(instance_key, "instance")?;
                for (register_key, register) in &instance.registers {
                    let rr = parse_key::<u16>(register_key, "register")?;
                    if register.status.as_deref() == Some("timeout") {
                        continue;
                    }
                    let value = b524::decode_hex(&register.raw_hex)
                        .map_err(|e| LoadError::RawHex(register_key.clone(), e))?;
                    let tt = register.tt.unwrap_or(0x01);
                    fixture.registers.insert((gg, ii, rr), Entry { value, tt });
                }
            }
        }
        Ok(fixture)
    }

    pub fn with_group(mut self, group: u8, descriptor_type: f32) -> Self {
        self.descriptors.insert(group, descriptor_type);
        self
    }

    pub fn with_register(mut self, group: u8, instance: u8, register: u16, value: &[u8]) -> Self {
        let entry = Entry { value: value.to_vec(), tt: 0x01 };
        self.registers.insert((group, instance, register), entry);
        self
    }

    pub fn with_identity(mut self, reply: &[u8]) -> Self {
        self.identity = Some(reply.to_vec());
        self
    }

    /// Report `header` as the echo layout for `opcode` replies.
    pub fn with_echo(mut self, opcode: RegisterOpcode, header: EchoHeader) -> Self {
        match opcode {
            RegisterOpcode::Local => self.local_echo = header,
            RegisterOpcode::Remote => self.remote_echo = header,
        }
        self
    }

    /// Make the next `count` sends of exactly `payload` time out.
    pub fn inject_timeouts(&mut self, payload: &[u8], count: usize) {
        *self.injected_timeouts.entry(payload.to_vec()).or_default() += count;
    }

    /// Number of requests sent so far.
    pub fn calls(&self) -> usize {
        self.sent.len()
    }

    /// Every B524 payload sent so far, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    fn answer(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if let Some(remaining) = self.injected_timeouts.get_mut(payload) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Timeout);
            }
        }
        let (selector, data) =
            Selector::parse(payload).map_err(|e| Error::Protocol(e.to_string()))?;
        match selector {
            Selector::Directory { group } => {
                let descriptor = self.descriptors.get(&group).copied().unwrap_or(0.0);
                Ok(descriptor.to_le_bytes().to_vec())
            }
            Selector::Register(selector) => {
                let key = (selector.group, selector.instance, selector.register);
                let value = match selector.optype {
                    Optype::Read => self.registers.get(&key).cloned().ok_or(Error::Timeout)?,
                    Optype::Write => {
                        let entry = Entry { value: data.to_vec(), tt: 0x01 };
                        self.registers.insert(key, entry.clone());
                        Entry { value: Vec::new(), ..entry }
                    }
                };
                let mut reply = match self.echo_header(selector.opcode) {
                    EchoHeader::Status => {
                        let [lo, hi] = selector.register.to_le_bytes();
                        vec![value.tt, selector.group, lo, hi]
                    }
                    EchoHeader::RequestPrefix(n) => {
                        selector.header()[..n.min(payload.len())].to_vec()
                    }
                };
                reply.extend_from_slice(&value.value);
                Ok(reply)
            }
            Selector::Timer(_) => Err(Error::Rejected("timer schedules are not emulated".into())),
        }
    }
}

impl Transport for FixtureTransport {
    async fn send_proto(
        &mut self,
        _destination: u8,
        primary: u8,
        secondary: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.sent.push(payload.to_vec());
        let reply = match (primary, secondary) {
            (b524::PRIMARY_COMMAND, b524::SECONDARY_COMMAND) => self.answer(payload),
            (0x07, 0x04) => self.identity.clone().ok_or(Error::Timeout),
            _ => Err(Error::Rejected(format!("{primary:02X}{secondary:02X} is not emulated"))),
        };
        trace!(message = "fixture reply", payload = ?payload, reply = ?reply);
        reply
    }

    fn echo_header(&self, opcode: RegisterOpcode) -> EchoHeader {
        match opcode {
            RegisterOpcode::Local => self.local_echo,
            RegisterOpcode::Remote => self.remote_echo,
        }
    }
}
