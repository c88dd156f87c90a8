use tracing::{debug, info, warn};

use super::{Engine, Error, recoverable};
use crate::b524::{self, EchoHeader, Optype, RegisterOpcode, RegisterSelector};
use crate::schema::Schema;
use crate::session::{ErrorKind, InFlight, RecordStatus, RegisterRecord, ScanSession};
use crate::transport::{self, Transport};
use crate::value::{self, WireType};

/// Turn a register reply into a record annotated from the schema.
///
/// Returns the error to log alongside when the reply could not be used.
pub fn build_record(
    schema: &Schema,
    header: EchoHeader,
    selector: &RegisterSelector,
    reply: &[u8],
) -> (RegisterRecord, Option<(ErrorKind, String)>) {
    let mut record = RegisterRecord::empty(
        selector.group,
        selector.instance,
        selector.register,
        selector.opcode,
        RecordStatus::Ok,
    );
    let entry = schema.lookup(selector.group, selector.register);
    record.semantic_name = entry.map(|e| e.semantic_path.clone());
    record.leaf_name = schema
        .leaf_name(selector.group, selector.instance, selector.register)
        .map(str::to_string);

    let reply = match b524::strip_echo(header, selector, reply) {
        Ok(reply) => reply,
        Err(error) => {
            let message = error.to_string();
            record.raw_bytes = reply.to_vec();
            record.status = RecordStatus::DecodeError;
            record.error = Some(message.clone());
            return (record, Some((ErrorKind::MalformedReply, message)));
        }
    };
    record.raw_bytes = reply.value.to_vec();
    record.reply_status = reply.status;
    if reply.value.is_empty() {
        return (record, None);
    }

    let typed = match entry.and_then(|e| e.wire_type) {
        Some(wire_type) => value::decode(wire_type, reply.value).map(|v| Some((wire_type, v))),
        None => Ok(value::infer(reply.value)),
    };
    match typed {
        Ok(Some((wire_type, value))) => {
            record.wire_type = Some(wire_type);
            record.enum_label = entry.and_then(|e| e.enum_label(&value));
            record.value = Some(value);
            (record, None)
        }
        Ok(None) => (record, None),
        Err(error) => {
            let message = error.to_string();
            record.wire_type = entry.and_then(|e| e.wire_type);
            record.status = RecordStatus::DecodeError;
            record.error = Some(message.clone());
            (record, Some((ErrorKind::Decode, message)))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteReport {
    pub wire_type: WireType,
    pub written: Vec<u8>,
    /// The register as read back after the write.
    pub readback: RegisterRecord,
}

impl WriteReport {
    /// Whether the device now holds exactly the written bytes.
    pub fn verified(&self) -> bool {
        self.readback.status == RecordStatus::Ok && self.readback.raw_bytes == self.written
    }
}

impl<T: Transport> Engine<T> {
    /// Read one register, retrying once on timeout.
    ///
    /// The record is returned rather than stored, but request counts and errors are recorded in
    /// `session`.
    pub async fn read_register(
        &mut self,
        session: &mut ScanSession,
        opcode: RegisterOpcode,
        group: u8,
        instance: u8,
        register: u16,
    ) -> Result<RegisterRecord, Error> {
        session.set_in_flight(Some(InFlight { group, instance, register, opcode }));
        let selector = RegisterSelector::read(opcode, group, instance, register);
        let reply = self.request(session, &selector.header()).await;
        let address = (Some(group), Some(instance), Some(register));
        let mut record = match recoverable(reply, session.phase())? {
            Ok(reply) => {
                let header = self.transport.echo_header(opcode);
                let (record, error) = build_record(&self.schema, header, &selector, &reply);
                if let Some((kind, message)) = error {
                    warn!(
                        message = "unusable register reply",
                        group,
                        instance,
                        register,
                        detail = %message,
                    );
                    session.push_error(address, kind, message);
                }
                record
            }
            Err(transport::Error::Timeout) => {
                let message = "no reply after retrying".to_string();
                debug!(message = "register read timed out", group, instance, register);
                session.push_error(address, ErrorKind::Timeout, message.clone());
                let mut record =
                    RegisterRecord::empty(group, instance, register, opcode, RecordStatus::Timeout);
                record.error = Some(message);
                record
            }
            Err(error) => {
                let message = error.to_string();
                debug!(message = "register read rejected", group, instance, register, %error);
                session.push_error(address, ErrorKind::Rejected, message.clone());
                let mut record =
                    RegisterRecord::empty(
                        group,
                        instance,
                        register,
                        opcode,
                        RecordStatus::Rejected,
                    );
                record.error = Some(message);
                record
            }
        };
        if record.semantic_name.is_none() {
            record.semantic_name =
                self.schema.lookup(group, register).map(|e| e.semantic_path.clone());
        }
        if record.leaf_name.is_none() {
            record.leaf_name =
                self.schema.leaf_name(group, instance, register).map(str::to_string);
        }
        Ok(record)
    }

    /// Write `literal` to a register and read it back.
    ///
    /// The type is `wire_type` if given, else the one the schema declares. The write itself is
    /// never retried.
    pub async fn write_register(
        &mut self,
        session: &mut ScanSession,
        opcode: RegisterOpcode,
        group: u8,
        instance: u8,
        register: u16,
        wire_type: Option<WireType>,
        literal: &str,
    ) -> Result<WriteReport, Error> {
        let wire_type = wire_type
            .or_else(|| self.schema.lookup(group, register).and_then(|e| e.wire_type))
            .ok_or(Error::UnknownType(group, register))?;
        let written = value::encode(wire_type, literal)
            .map_err(|e| Error::Encode(e, literal.to_string(), wire_type))?;
        let selector =
            RegisterSelector { opcode, optype: Optype::Write, group, instance, register };
        let payload = b524::register_write(opcode, group, instance, register, &written);
        info!(
            message = "writing register",
            group,
            instance,
            register,
            %wire_type,
            data = %b524::encode_hex(&written),
        );
        session.count_request();
        let reply =
            self.transport.send(self.config.destination, &payload).await.map_err(Error::Write)?;
        let header = self.transport.echo_header(opcode);
        b524::strip_echo(header, &selector, &reply).map_err(Error::WriteAcknowledgement)?;

        let readback = self.read_register(session, opcode, group, instance, register).await?;
        let report = WriteReport { wire_type, written, readback };
        if !report.verified() {
            warn!(
                message = "read back differs from the written value",
                written = %b524::encode_hex(&report.written),
                read = %b524::encode_hex(&report.readback.raw_bytes),
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = "\
# type,circuit,level,name,comment,QQ,ZZ,PBSB,ID,field,part,type,divider/values,unit,comment
r,Hc,,Curve,,,15,b524,020002000f00,,s,UIN,,,
r,Hc,,FlowTemp,,,15,b524,020002001000,,s,EXP,,°C,
r,,,Mode,,,15,b524,020002001100,,s,UCH,\"0=off;1=auto\",,
";

    fn selector(register: u16) -> RegisterSelector {
        RegisterSelector::read(RegisterOpcode::Local, 0x02, 0x00, register)
    }

    #[test]
    fn schema_type_wins_over_inference() {
        let schema = Schema::from_csv(SCHEMA.as_bytes());
        let reply = [0x02, 0x00, 0x02, 0x00, 0x0F, 0x00, 0x34, 0x12];
        let (record, error) =
            build_record(&schema, EchoHeader::RequestPrefix(6), &selector(0x000F), &reply);
        assert_eq!(error, None);
        assert_eq!(record.value, Some(Value::Integer(0x1234)));
        assert_eq!(record.wire_type, Some(WireType::U16));
        assert_eq!(record.semantic_name.as_deref(), Some("Hc.Curve"));
        assert_eq!(record.raw_bytes, [0x34, 0x12]);
    }

    #[test]
    fn leaf_names_follow_the_instance() {
        let leaf_names = crate::schema::LeafNames::from_csv(
            b"group,instance,register,leaf\n0x02,*,0x000f,heatingCurve\n0x02,1,0x000f,curveTwo\n",
        )
        .unwrap();
        let schema = Schema::from_csv(SCHEMA.as_bytes()).with_leaf_names(leaf_names);
        let reply = [0x02, 0x00, 0x02, 0x00, 0x0F, 0x00, 0x34, 0x12];
        let (record, _) =
            build_record(&schema, EchoHeader::RequestPrefix(6), &selector(0x000F), &reply);
        assert_eq!(record.leaf_name.as_deref(), Some("heatingCurve"));

        let second = RegisterSelector::read(RegisterOpcode::Local, 0x02, 0x01, 0x000F);
        let reply = [0x02, 0x01, 0x02, 0x01, 0x0F, 0x00, 0x34, 0x12];
        let (record, _) = build_record(&schema, EchoHeader::RequestPrefix(6), &second, &reply);
        assert_eq!(record.leaf_name.as_deref(), Some("curveTwo"));
    }

    #[test]
    fn unknown_registers_are_inferred() {
        let reply = [0x01, 0x02, 0x20, 0x00, 0x00, 0x00, 0xC0, 0x7F];
        let (record, error) =
            build_record(&Schema::empty(), EchoHeader::Status, &selector(0x0020), &reply);
        assert_eq!(error, None);
        assert_eq!(record.wire_type, Some(WireType::Float32));
        assert_eq!(record.value, Some(Value::Absent));
        assert_eq!(record.reply_status, Some(0x01));
    }

    #[test]
    fn length_mismatch_is_a_decode_error() {
        let schema = Schema::from_csv(SCHEMA.as_bytes());
        let reply = [0x02, 0x00, 0x02, 0x00, 0x10, 0x00, 0x34, 0x12];
        let (record, error) =
            build_record(&schema, EchoHeader::RequestPrefix(6), &selector(0x0010), &reply);
        assert_eq!(record.status, RecordStatus::DecodeError);
        assert_eq!(record.raw_bytes, [0x34, 0x12]);
        assert_eq!(error.map(|(kind, _)| kind), Some(ErrorKind::Decode));
    }

    #[test]
    fn unknown_enum_values_are_not_errors() {
        let schema = Schema::from_csv(SCHEMA.as_bytes());
        let reply = [0x02, 0x00, 0x02, 0x00, 0x11, 0x00, 0x05];
        let (record, error) =
            build_record(&schema, EchoHeader::RequestPrefix(6), &selector(0x0011), &reply);
        assert_eq!(error, None);
        assert_eq!(record.value, Some(Value::Integer(5)));
        assert_eq!(record.enum_label.as_deref(), Some("UNKNOWN_5"));
    }

    #[test]
    fn mismatched_echo_keeps_the_whole_reply() {
        let reply = [0x01, 0x03, 0x0F, 0x00, 0x34, 0x12];
        let (record, error) =
            build_record(&Schema::empty(), EchoHeader::Status, &selector(0x000F), &reply);
        assert_eq!(record.status, RecordStatus::DecodeError);
        assert_eq!(record.raw_bytes, reply);
        assert_eq!(error.map(|(kind, _)| kind), Some(ErrorKind::MalformedReply));
    }
}
