//! The B524 request payloads and reply envelopes.
//!
//! B524 payloads are dispatched by their first byte:
//!
//! * `00 GG 00` probes the group directory and is answered with a `f32` descriptor;
//! * `02|06 OT GG II RR_LO RR_HI [data]` reads (`OT=00`) or writes (`OT=01`) a local (`02`) or
//!   remote (`06`) register;
//! * `03|04 S1 S2 S3 WD [data]` reads or writes a timer schedule. These are recognized but their
//!   contents are not interpreted.

use tracing::trace;

pub const PRIMARY_COMMAND: u8 = 0xB5;
pub const SECONDARY_COMMAND: u8 = 0x24;

const DIRECTORY_LEN: usize = 3;
const REGISTER_LEN: usize = 6;
const TIMER_LEN: usize = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("payload is empty")]
    Empty,
    #[error("`{0}` is not valid hex")]
    Hex(String),
    #[error("unknown B524 opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("opcode {0:#04x} expects {1} bytes, got {2}")]
    Length(u8, usize, usize),
    #[error("opcode {0:#04x} expects optype 0x00 (read) or 0x01 (write), got {1:#04x}")]
    Optype(u8, u8),
    #[error("directory probe expects a trailing 0x00, got {0:#04x}")]
    DirectoryTrailer(u8),
    #[error("timer weekday must be 0x00..=0x06, got {0:#04x}")]
    Weekday(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, strum::FromRepr)]
#[derive(serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RegisterOpcode {
    Local = 0x02,
    Remote = 0x06,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum Optype {
    Read = 0x00,
    Write = 0x01,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum TimerOpcode {
    Read = 0x03,
    Write = 0x04,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSelector {
    pub opcode: RegisterOpcode,
    pub optype: Optype,
    pub group: u8,
    pub instance: u8,
    pub register: u16,
}

impl RegisterSelector {
    pub fn read(opcode: RegisterOpcode, group: u8, instance: u8, register: u16) -> Self {
        Self { opcode, optype: Optype::Read, group, instance, register }
    }

    pub fn header(&self) -> [u8; REGISTER_LEN] {
        let [lo, hi] = self.register.to_le_bytes();
        [self.opcode as u8, self.optype as u8, self.group, self.instance, lo, hi]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerSelector {
    pub opcode: TimerOpcode,
    pub selector: [u8; 3],
    pub weekday: u8,
}

/// The addressing part of a B524 payload, one variant per opcode family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    Directory { group: u8 },
    Register(RegisterSelector),
    Timer(TimerSelector),
}

impl Selector {
    /// Split a request payload into its selector and any trailing write data.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), Error> {
        let Some(&opcode) = payload.first() else {
            return Err(Error::Empty);
        };
        if opcode == 0x00 {
            let [_, group, trailer] = payload else {
                return Err(Error::Length(opcode, DIRECTORY_LEN, payload.len()));
            };
            if *trailer != 0x00 {
                return Err(Error::DirectoryTrailer(*trailer));
            }
            return Ok((Self::Directory { group: *group }, &[]));
        }
        if let Some(register_opcode) = RegisterOpcode::from_repr(opcode) {
            let Some((header, data)) = payload.split_first_chunk::<REGISTER_LEN>() else {
                return Err(Error::Length(opcode, REGISTER_LEN, payload.len()));
            };
            let [_, optype, group, instance, lo, hi] = *header;
            let optype = Optype::from_repr(optype).ok_or(Error::Optype(opcode, optype))?;
            if optype == Optype::Read && !data.is_empty() {
                return Err(Error::Length(opcode, REGISTER_LEN, payload.len()));
            }
            let selector = RegisterSelector {
                opcode: register_opcode,
                optype,
                group,
                instance,
                register: u16::from_le_bytes([lo, hi]),
            };
            return Ok((Self::Register(selector), data));
        }
        if let Some(timer_opcode) = TimerOpcode::from_repr(opcode) {
            let Some((header, data)) = payload.split_first_chunk::<TIMER_LEN>() else {
                return Err(Error::Length(opcode, TIMER_LEN, payload.len()));
            };
            let [_, s1, s2, s3, weekday] = *header;
            if weekday > 0x06 {
                return Err(Error::Weekday(weekday));
            }
            if timer_opcode == TimerOpcode::Read && !data.is_empty() {
                return Err(Error::Length(opcode, TIMER_LEN, payload.len()));
            }
            let selector = TimerSelector { opcode: timer_opcode, selector: [s1, s2, s3], weekday };
            return Ok((Self::Timer(selector), data));
        }
        Err(Error::UnknownOpcode(opcode))
    }

    /// Parse the hex-encoded selector of a schema row, e.g. `b524,020003001600`.
    ///
    /// Unlike [`Selector::parse`] no trailing data is accepted.
    pub fn from_id(id: &str) -> Result<Self, Error> {
        let mut text = id.trim();
        if text.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("b524,")) {
            text = text[5..].trim();
        }
        let payload = decode_hex(text)?;
        let (selector, data) = Self::parse(&payload)?;
        if !data.is_empty() {
            let (opcode, expected) = match selector {
                Self::Directory { .. } => (0x00, DIRECTORY_LEN),
                Self::Register(r) => (r.opcode as u8, REGISTER_LEN),
                Self::Timer(t) => (t.opcode as u8, TIMER_LEN),
            };
            return Err(Error::Length(opcode, expected, payload.len()));
        }
        Ok(selector)
    }
}

/// Parse a hex string into bytes. Whitespace and a leading `0x` are tolerated.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, Error> {
    let trimmed = text.trim();
    let digits =
        trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    let digits = digits.split_ascii_whitespace().collect::<String>();
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(Error::Hex(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| Error::Hex(text.to_string()))
        })
        .collect()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn directory_probe(group: u8) -> Vec<u8> {
    vec![0x00, group, 0x00]
}

pub fn register_read(opcode: RegisterOpcode, group: u8, instance: u8, register: u16) -> Vec<u8> {
    RegisterSelector::read(opcode, group, instance, register).header().to_vec()
}

pub fn register_write(
    opcode: RegisterOpcode,
    group: u8,
    instance: u8,
    register: u16,
    data: &[u8],
) -> Vec<u8> {
    let selector = RegisterSelector { opcode, optype: Optype::Write, group, instance, register };
    let mut payload = selector.header().to_vec();
    payload.extend_from_slice(data);
    payload
}

/// How a device prefixes the value bytes of a register reply.
///
/// The layout differs between bus adapters and firmware, so it is reported by the transport
/// rather than assumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EchoHeader {
    /// `<TT> <GG> <RR_LO> <RR_HI>`: a status byte followed by the echoed group and register.
    Status,
    /// The first `n` bytes of the request payload, echoed verbatim.
    RequestPrefix(usize),
}

impl EchoHeader {
    pub const STATUS_LEN: usize = 4;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("reply of {1} bytes is shorter than the expected {0}")]
    Short(usize, usize),
    #[error("reply echoes GG={0:#04x} RR={1:#06x}, expected GG={2:#04x} RR={3:#06x}")]
    AddressMismatch(u8, u16, u8, u16),
    #[error("reply echo {0:02x?} does not match the request {1:02x?}")]
    EchoMismatch(Vec<u8>, Vec<u8>),
}

/// The interpreted status byte of a device-native register reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ReplyStatus {
    NoData = 0x00,
    Live = 0x01,
    ParameterLimit = 0x02,
    ParameterConfig = 0x03,
}

impl ReplyStatus {
    pub fn describe(tt: u8) -> &'static str {
        Self::from_repr(tt).map(<&'static str>::from).unwrap_or("unknown")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterReply<'a> {
    /// The `TT` byte, for replies that carry one.
    pub status: Option<u8>,
    pub value: &'a [u8],
}

impl RegisterReply<'_> {
    pub fn is_no_data(&self) -> bool {
        self.status == Some(ReplyStatus::NoData as u8)
    }
}

/// Remove the echo header from a register reply, validating it against the request.
pub fn strip_echo<'a>(
    header: EchoHeader,
    request: &RegisterSelector,
    reply: &'a [u8],
) -> Result<RegisterReply<'a>, ReplyError> {
    trace!(message = "stripping echo", ?header, reply = ?reply);
    match header {
        EchoHeader::Status => {
            if let [tt] = reply {
                // Status-only reply: no echo, no value.
                return Ok(RegisterReply { status: Some(*tt), value: &[] });
            }
            let Some(([tt, group, lo, hi], value)) = reply.split_first_chunk::<4>() else {
                return Err(ReplyError::Short(EchoHeader::STATUS_LEN, reply.len()));
            };
            let register = u16::from_le_bytes([*lo, *hi]);
            if *group != request.group || register != request.register {
                return Err(ReplyError::AddressMismatch(
                    *group,
                    register,
                    request.group,
                    request.register,
                ));
            }
            Ok(RegisterReply { status: Some(*tt), value })
        }
        EchoHeader::RequestPrefix(n) => {
            let expected = request.header();
            let n = n.min(expected.len());
            let Some((echo, value)) = reply.split_at_checked(n) else {
                return Err(ReplyError::Short(n, reply.len()));
            };
            if echo != &expected[..n] {
                return Err(ReplyError::EchoMismatch(echo.to_vec(), expected[..n].to_vec()));
            }
            Ok(RegisterReply { status: None, value })
        }
    }
}

/// Decode a directory probe reply into its descriptor.
pub fn parse_directory(reply: &[u8]) -> Result<f32, ReplyError> {
    let Some((descriptor, _)) = reply.split_first_chunk::<4>() else {
        return Err(ReplyError::Short(4, reply.len()));
    };
    Ok(f32::from_le_bytes(*descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_payloads() {
        assert_eq!(
            encode_hex(&register_read(RegisterOpcode::Local, 0x03, 0x00, 0x0016)),
            "020003001600"
        );
        assert_eq!(
            encode_hex(&register_read(RegisterOpcode::Remote, 0x09, 0x01, 0x0007)),
            "060009010700"
        );
        assert_eq!(encode_hex(&directory_probe(0x03)), "000300");
        assert_eq!(
            encode_hex(&register_write(RegisterOpcode::Local, 0x02, 0x01, 0x0002, &[0x34, 0x12])),
            "0201020102003412"
        );
    }

    #[test]
    fn parses_schema_ids() {
        assert_eq!(
            Selector::from_id("b524,020003001600"),
            Ok(Selector::Register(RegisterSelector::read(RegisterOpcode::Local, 3, 0, 0x16)))
        );
        assert_eq!(
            Selector::from_id("0300000100"),
            Ok(Selector::Timer(TimerSelector {
                opcode: TimerOpcode::Read,
                selector: [0, 0, 1],
                weekday: 0
            }))
        );
        assert_eq!(Selector::from_id("000500"), Ok(Selector::Directory { group: 5 }));
        assert_eq!(Selector::from_id("0700"), Err(Error::UnknownOpcode(0x07)));
        assert_eq!(Selector::from_id("02000300"), Err(Error::Length(0x02, 6, 4)));
        assert_eq!(Selector::from_id("020203001600"), Err(Error::Optype(0x02, 0x02)));
        assert_eq!(Selector::from_id("0300000107"), Err(Error::Weekday(0x07)));
        assert_eq!(Selector::from_id("02zz"), Err(Error::Hex("02zz".into())));
        assert_eq!(Selector::from_id(""), Err(Error::Empty));
    }

    #[test]
    fn write_payload_carries_data() {
        let payload = register_write(RegisterOpcode::Remote, 0x09, 0x00, 0x0010, &[1, 2]);
        let (selector, data) = Selector::parse(&payload).unwrap();
        let Selector::Register(selector) = selector else { panic!("not a register selector") };
        assert_eq!(selector.optype, Optype::Write);
        assert_eq!(data, &[1, 2]);
        assert!(Selector::from_id(&encode_hex(&payload)).is_err());
    }

    #[test]
    fn strips_full_request_echo() {
        let request = RegisterSelector::read(RegisterOpcode::Local, 0x03, 0x00, 0x0016);
        let mut reply = request.header().to_vec();
        reply.extend([0xAA, 0xBB]);
        let stripped = strip_echo(EchoHeader::RequestPrefix(6), &request, &reply).unwrap();
        assert_eq!(stripped.value, &[0xAA, 0xBB]);
        // A four byte assumption would leak the register id into the value.
        let wrong = strip_echo(EchoHeader::RequestPrefix(4), &request, &reply).unwrap();
        assert_eq!(wrong.value, &[0x16, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn strips_status_echo() {
        let request = RegisterSelector::read(RegisterOpcode::Local, 0x02, 0x01, 0x000F);
        let reply = [0x01, 0x02, 0x0F, 0x00, 0x34, 0x12];
        let stripped = strip_echo(EchoHeader::Status, &request, &reply).unwrap();
        assert_eq!(stripped, RegisterReply { status: Some(0x01), value: &[0x34, 0x12] });
        assert_eq!(ReplyStatus::describe(0x01), "live");
        assert_eq!(ReplyStatus::describe(0x03), "parameter_config");
        assert_eq!(ReplyStatus::describe(0x7F), "unknown");

        let status_only = strip_echo(EchoHeader::Status, &request, &[0x00]).unwrap();
        assert!(status_only.is_no_data());
        assert!(status_only.value.is_empty());

        assert_eq!(
            strip_echo(EchoHeader::Status, &request, &[0x01, 0x03, 0x0F, 0x00]),
            Err(ReplyError::AddressMismatch(0x03, 0x000F, 0x02, 0x000F))
        );
        assert_eq!(strip_echo(EchoHeader::Status, &request, &[1, 2]), Err(ReplyError::Short(4, 2)));
    }

    #[test]
    fn directory_descriptor() {
        assert_eq!(parse_directory(&1.0f32.to_le_bytes()), Ok(1.0));
        assert!(parse_directory(&f32::NAN.to_le_bytes()).unwrap().is_nan());
        assert_eq!(parse_directory(&[0, 0]), Err(ReplyError::Short(4, 2)));
    }
}
