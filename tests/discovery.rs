use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use vrc_explorer::b524::{self, EchoHeader, RegisterOpcode};
use vrc_explorer::discovery::{Config, Engine, Error};
use vrc_explorer::progress::{self, ProgressEvent};
use vrc_explorer::schema::{LeafNames, Schema};
use vrc_explorer::session::{Outcome, Phase, RecordStatus, ScanSession};
use vrc_explorer::transport::fixture::FixtureTransport;
use vrc_explorer::transport::{self, Transport};
use vrc_explorer::value::{Value, WireType};

fn engine_with_schema<T: Transport>(transport: T, schema: Schema) -> Engine<T> {
    let config = Config { retry_backoff: Duration::ZERO, ..Config::new(0x15) };
    let (events, _) = progress::channel();
    Engine::new(transport, Arc::new(schema), config, events)
}

fn engine<T: Transport>(transport: T) -> Engine<T> {
    engine_with_schema(transport, Schema::empty())
}

fn heating_circuit_fixture() -> FixtureTransport {
    let fixture = json!({
        "meta": {"identity_hex": "b5424149303005021704"},
        "groups": {
            "0x02": {"descriptor_type": 1.0, "instances": {
                "0x00": {"registers": {
                    "0x0002": {"raw_hex": "0100"},
                    "0x000f": {"raw_hex": "3412"},
                    "0x0010": {"raw_hex": "0000c07f"},
                }},
                "0x01": {"registers": {"0x0002": {"raw_hex": "ffff"}}},
            }},
            "0x03": {"descriptor_type": null},
        }
    });
    FixtureTransport::from_json(&serde_json::to_vec(&fixture).unwrap()).unwrap()
}

async fn scan<T: Transport>(engine: &mut Engine<T>) -> ScanSession {
    let mut session = ScanSession::new(0x15);
    let outcome = engine.run(&mut session, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    session
}

#[tokio::test]
async fn heating_circuit_register_is_decoded() {
    let mut engine = engine(heating_circuit_fixture());
    let session = scan(&mut engine).await;

    assert_eq!(session.phase(), Phase::Completed);
    assert_eq!(session.groups.len(), 1);
    assert_eq!(session.groups[0].group, 0x02);
    assert_eq!(session.identity.as_ref().map(|i| i.device_id.as_str()), Some("BAI00"));

    let record = session.records_for(0x02, 0x00).find(|r| r.register == 0x000F).unwrap();
    assert_eq!(record.status, RecordStatus::Ok);
    assert_eq!(record.wire_type, Some(WireType::U16));
    assert_eq!(record.value, Some(Value::Integer(0x1234)));
    assert_eq!(record.raw_bytes, [0x34, 0x12]);

    let artifact = serde_json::to_value(session.artifact()).unwrap();
    let registers = &artifact["groups"]["0x02"]["instances"]["0x00"]["registers"];
    assert_eq!(registers["0x000f"]["value"], 4660);
    assert_eq!(registers["0x000f"]["raw_hex"], "3412");
    assert_eq!(artifact["meta"]["incomplete"], false);
}

#[tokio::test]
async fn circuit_registers_carry_names_and_contextual_enums() {
    let leaf_names = LeafNames::from_csv(
        b"group,instance,register,leaf\n0x02,*,0x000f,heatingCurve\n0x02,0x01,0x000f,other\n",
    )
    .unwrap();
    let schema = Schema::empty().with_leaf_names(leaf_names);
    let mut engine = engine_with_schema(heating_circuit_fixture(), schema);
    let session = scan(&mut engine).await;

    let artifact = serde_json::to_value(session.artifact()).unwrap();
    let registers = &artifact["groups"]["0x02"]["instances"]["0x00"]["registers"];
    assert_eq!(registers["0x000f"]["myvaillant_name"], "heatingCurve");
    assert!(registers["0x0010"].get("myvaillant_name").is_none());
    // No cooling flag was read and there is no cylinder group.
    assert_eq!(registers["0x0002"]["enum_raw_name"], "HEATING_OR_COOLING");
    assert_eq!(registers["0x0002"]["enum_resolved_name"], "HEATING");
    assert_eq!(registers["0x0002"]["value_display"], "1 (HEATING)");
}

#[tokio::test]
async fn holes_are_skipped_and_the_terminator_stops_discovery() {
    let mut engine = engine(heating_circuit_fixture());
    let session = scan(&mut engine).await;

    // 0x00 and 0x01 are unconfigured and answer 0.0.
    assert!(session.groups.iter().all(|g| g.group == 0x02));
    let directory_probes = engine
        .transport()
        .sent()
        .iter()
        .filter(|p| p.len() == 3 && p[0] == 0x00)
        .map(|p| p[1])
        .collect::<Vec<_>>();
    assert_eq!(directory_probes, [0x00, 0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn absent_instances_have_no_records() {
    let mut engine = engine(heating_circuit_fixture());
    let session = scan(&mut engine).await;

    let present = session.instances.iter().filter(|s| s.present).collect::<Vec<_>>();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].instance, 0x00);
    // `0xFFFF` in register 0x0002 marks an unused heating circuit.
    assert!(session.instances.iter().any(|s| s.instance == 0x01 && !s.present));
    for slot in session.instances.iter().filter(|s| !s.present) {
        assert_eq!(session.records_for(slot.group, slot.instance).count(), 0);
    }
    assert_eq!(session.records_for(0x02, 0x00).count(), 0x26);

    let artifact = serde_json::to_value(session.artifact()).unwrap();
    let absent = &artifact["groups"]["0x02"]["instances"]["0x01"];
    assert_eq!(absent["present"], false);
    assert!(absent.get("registers").is_none());
}

#[tokio::test]
async fn nan_is_serialized_as_null() {
    let mut engine = engine(heating_circuit_fixture());
    let session = scan(&mut engine).await;

    let record = session.records_for(0x02, 0x00).find(|r| r.register == 0x0010).unwrap();
    assert_eq!(record.value, Some(Value::Absent));
    let text = serde_json::to_string(&session.artifact()).unwrap();
    assert!(!text.contains("NaN"));
    let artifact: serde_json::Value = serde_json::from_str(&text).unwrap();
    let register = &artifact["groups"]["0x02"]["instances"]["0x00"]["registers"]["0x0010"];
    assert_eq!(register["value"], serde_json::Value::Null);
    assert_eq!(register["type"], "EXP");
}

#[tokio::test]
async fn timeouts_are_retried_exactly_once() {
    let read = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
    let mut fixture = heating_circuit_fixture();
    fixture.inject_timeouts(&read, 2);
    let mut engine = engine(fixture);
    let mut session = ScanSession::new(0x15);
    let record = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F)
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::Timeout);
    assert_eq!(engine.transport().sent().iter().filter(|p| **p == read).count(), 2);
    assert_eq!(session.errors.len(), 1);

    // The injected timeouts are used up, so the next read succeeds.
    let record = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F)
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::Ok);
    assert_eq!(engine.transport().sent().iter().filter(|p| **p == read).count(), 3);
}

#[tokio::test]
async fn a_single_timeout_is_recovered() {
    let read = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
    let mut fixture = heating_circuit_fixture();
    fixture.inject_timeouts(&read, 1);
    let mut engine = engine(fixture);
    let mut session = ScanSession::new(0x15);
    let record = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F)
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::Ok);
    assert_eq!(record.value, Some(Value::Integer(4660)));
    assert_eq!(session.probe_count(), 2);
    assert!(session.errors.is_empty());
}

#[tokio::test]
async fn reads_are_idempotent() {
    let mut engine = engine(heating_circuit_fixture());
    let mut session = ScanSession::new(0x15);
    let first = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F)
        .await
        .unwrap();
    let second = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F)
        .await
        .unwrap();
    assert_eq!((&first.value, first.status), (&second.value, second.status));
}

#[tokio::test]
async fn echo_length_comes_from_the_transport() {
    for header in [EchoHeader::RequestPrefix(6), EchoHeader::Status] {
        let fixture = FixtureTransport::new()
            .with_register(0x03, 0x00, 0x0016, &[0x34, 0x12])
            .with_echo(RegisterOpcode::Local, header);
        let mut engine = engine(fixture);
        let mut session = ScanSession::new(0x15);
        let record = engine
            .read_register(&mut session, RegisterOpcode::Local, 0x03, 0x00, 0x0016)
            .await
            .unwrap();
        // Stripping a fixed four bytes would leave `16 00 34 12` behind for the six byte echo.
        assert_eq!(record.raw_bytes, [0x34, 0x12], "{header:?}");
        assert_eq!(record.status, RecordStatus::Ok);
    }
}

#[tokio::test]
async fn unknown_enum_values_get_a_placeholder_label() {
    let schema = Schema::from_csv(
        b"r,,,OpMode,,,15,b524,020003001600,,s,UCH,\"0=off;1=auto;2=day\",,\n",
    );
    let fixture = FixtureTransport::new().with_register(0x03, 0x00, 0x0016, &[0x07]);
    let mut engine = engine_with_schema(fixture, schema);
    let mut session = ScanSession::new(0x15);
    let record = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x03, 0x00, 0x0016)
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::Ok);
    assert_eq!(record.value, Some(Value::Integer(7)));
    assert_eq!(record.enum_label.as_deref(), Some("UNKNOWN_7"));
    assert_eq!(record.semantic_name.as_deref(), Some("OpMode"));
    assert!(session.errors.is_empty());
}

#[tokio::test]
async fn decode_errors_keep_the_raw_bytes() {
    let schema = Schema::from_csv(b"r,,,FlowTemp,,,15,b524,020002001000,,s,EXP,,,\n");
    let fixture = FixtureTransport::new().with_register(0x02, 0x00, 0x0010, &[0x01, 0x02]);
    let mut engine = engine_with_schema(fixture, schema);
    let mut session = ScanSession::new(0x15);
    let record = engine
        .read_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x0010)
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::DecodeError);
    assert_eq!(record.raw_bytes, [0x01, 0x02]);
    assert_eq!(session.errors.len(), 1);
}

/// Cancels the scan once a given payload has been sent.
struct CancelAfter {
    inner: FixtureTransport,
    trigger: Vec<u8>,
    cancel: CancellationToken,
}

impl Transport for CancelAfter {
    async fn send_proto(
        &mut self,
        destination: u8,
        primary: u8,
        secondary: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, transport::Error> {
        if payload == self.trigger.as_slice() {
            self.cancel.cancel();
        }
        self.inner.send_proto(destination, primary, secondary, payload).await
    }

    fn echo_header(&self, opcode: RegisterOpcode) -> EchoHeader {
        self.inner.echo_header(opcode)
    }
}

#[tokio::test]
async fn cancellation_keeps_collected_records() {
    let cancel = CancellationToken::new();
    let inner = FixtureTransport::new()
        .with_group(0x00, 3.0)
        .with_group(0x01, f32::NAN)
        .with_register(0x00, 0x00, 0x0003, &[0x2A]);
    let transport = CancelAfter {
        inner,
        trigger: b524::register_read(RegisterOpcode::Local, 0x00, 0x00, 0x0005),
        cancel: cancel.clone(),
    };
    let mut engine = engine(transport);
    let mut session = ScanSession::new(0x15);
    let outcome = engine.run(&mut session, &cancel).await.unwrap();
    assert!(matches!(outcome, Outcome::Cancelled { .. }));
    assert_eq!(session.phase(), Phase::Cancelled);
    assert_eq!(
        session.registers.iter().map(|r| r.register).collect::<Vec<_>>(),
        [0, 1, 2, 3, 4, 5]
    );
    assert_eq!(session.registers[3].value, Some(Value::Integer(42)));

    let artifact = session.artifact();
    assert!(artifact.meta.incomplete);
    assert!(!artifact.meta.incomplete_reason.unwrap_or_default().is_empty());
    let registers = &artifact.groups["0x00"].instances["0x00"].registers;
    assert_eq!(registers.len(), 6);
}

#[tokio::test]
async fn artifacts_replay_as_fixtures() {
    let mut engine = engine(heating_circuit_fixture());
    let session = scan(&mut engine).await;
    let saved = serde_json::to_vec(&session.artifact()).unwrap();

    let mut replay = self::engine(FixtureTransport::from_json(&saved).unwrap());
    let replayed = scan(&mut replay).await;
    let values = |s: &ScanSession| {
        s.registers
            .iter()
            .filter(|r| r.status == RecordStatus::Ok)
            .map(|r| (r.group, r.instance, r.register, r.value.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(values(&session), values(&replayed));
    assert_eq!(session.instances, replayed.instances);
}

#[tokio::test]
async fn writes_are_verified_by_reading_back() {
    let fixture = FixtureTransport::new().with_register(0x02, 0x00, 0x000F, &[0x00, 0x00]);
    let mut engine = engine(fixture);
    let mut session = ScanSession::new(0x15);
    let report = engine
        .write_register(
            &mut session,
            RegisterOpcode::Local,
            0x02,
            0x00,
            0x000F,
            Some(WireType::U16),
            "0x1234",
        )
        .await
        .unwrap();
    assert!(report.verified());
    assert_eq!(report.written, [0x34, 0x12]);
    assert_eq!(report.readback.value, Some(Value::Integer(0x1234)));
    let write = b524::register_write(RegisterOpcode::Local, 0x02, 0x00, 0x000F, &[0x34, 0x12]);
    assert_eq!(engine.transport().sent()[0], write);

    let error = engine
        .write_register(&mut session, RegisterOpcode::Local, 0x02, 0x00, 0x000F, None, "1")
        .await
        .unwrap_err();
    assert!(matches!(error, Error::UnknownType(0x02, 0x000F)));
}

#[tokio::test]
async fn progress_follows_ascending_addresses() {
    let (events, mut receiver) = progress::channel();
    let config = Config { retry_backoff: Duration::ZERO, ..Config::new(0x15) };
    let mut engine =
        Engine::new(heating_circuit_fixture(), Arc::new(Schema::empty()), config, events);
    scan(&mut engine).await;
    drop(engine);

    let mut phases = Vec::new();
    let mut registers = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        match event {
            ProgressEvent::PhaseStarted { phase, .. } => phases.push(phase),
            ProgressEvent::RegisterRead { group, instance, register, .. } => {
                registers.push((group, instance, register))
            }
            _ => {}
        }
    }
    assert_eq!(
        phases,
        [Phase::GroupDiscovery, Phase::Classification, Phase::InstancePresence, Phase::RegisterScan]
    );
    assert!(registers.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(registers.len(), 0x26);
}

/// `(opcode, register)` of every register read sent for one instance, in order.
fn reads_of(engine: &Engine<FixtureTransport>, group: u8, instance: u8) -> Vec<(u8, u16)> {
    engine
        .transport()
        .sent()
        .iter()
        .filter(|p| p.len() == 6 && p[2] == group && p[3] == instance)
        .map(|p| (p[0], u16::from_le_bytes([p[4], p[5]])))
        .collect()
}

fn present_slots(session: &ScanSession) -> Vec<(u8, u8)> {
    session.instances.iter().filter(|s| s.present).map(|s| (s.group, s.instance)).collect()
}

#[tokio::test]
async fn zones_marked_unused_are_absent() {
    let fixture = FixtureTransport::new()
        .with_group(0x03, 1.0)
        .with_group(0x04, f32::NAN)
        .with_register(0x03, 0x01, 0x001C, &[0xFF])
        .with_register(0x03, 0x02, 0x001C, &[0x00]);
    let mut engine = engine(fixture);
    let session = scan(&mut engine).await;

    assert_eq!(session.instances.len(), 0x0B);
    assert_eq!(present_slots(&session), [(0x03, 0x02)]);
    assert_eq!(session.records_for(0x03, 0x01).count(), 0);
    assert_eq!(session.records_for(0x03, 0x02).count(), 0x30);
    // Only the zone rule's register is consulted for absent slots.
    assert!(reads_of(&engine, 0x03, 0x01).iter().all(|(_, r)| *r == 0x001C));
    assert!(session.errors.iter().all(|e| e.phase != Phase::InstancePresence));
}

#[tokio::test]
async fn remote_sensors_are_read_with_the_remote_opcode() {
    let fixture = FixtureTransport::new()
        .with_group(0x09, 1.0)
        .with_group(0x0A, f32::NAN)
        .with_register(0x09, 0x05, 0x0007, &f32::NAN.to_le_bytes())
        .with_register(0x09, 0x05, 0x000F, &21.5f32.to_le_bytes());
    let mut engine = engine(fixture);
    let session = scan(&mut engine).await;

    assert_eq!(present_slots(&session), [(0x09, 0x05)]);
    let reads = reads_of(&engine, 0x09, 0x05);
    assert_eq!(reads[..2], [(0x06, 0x0007), (0x06, 0x000F)]);
    let opcodes = (0x00..=0x0A)
        .flat_map(|instance| reads_of(&engine, 0x09, instance))
        .map(|(opcode, _)| opcode)
        .collect::<std::collections::BTreeSet<_>>();
    assert_eq!(opcodes.into_iter().collect::<Vec<_>>(), [0x06]);
    let record = session.records_for(0x09, 0x05).find(|r| r.register == 0x000F).unwrap();
    assert_eq!(record.value, Some(Value::Float(21.5)));
}

#[tokio::test]
async fn unknown_instanced_groups_check_the_generic_registers() {
    let fixture = FixtureTransport::new()
        .with_group(0x20, 1.0)
        .with_group(0x21, f32::NAN)
        .with_register(0x20, 0x03, 0x0016, &[0x01]);
    let mut engine = engine(fixture);
    let session = scan(&mut engine).await;

    assert_eq!(session.groups[0].name, "Unknown");
    assert_eq!(present_slots(&session), [(0x20, 0x03)]);
    let mut checked = reads_of(&engine, 0x20, 0x00);
    checked.dedup();
    assert_eq!(
        checked.iter().map(|(_, r)| *r).collect::<Vec<_>>(),
        vrc_explorer::groups::GENERIC_PRESENCE_PROBES
    );
    assert!(checked.iter().all(|(opcode, _)| *opcode == 0x02));
    assert_eq!(session.records_for(0x20, 0x03).count(), 0x31);
}

#[tokio::test]
async fn cylinder_instances_are_assumed_present() {
    let fixture = FixtureTransport::new()
        .with_group(0x05, 1.0)
        .with_group(0x06, f32::NAN)
        .with_register(0x05, 0x00, 0x0000, &[0x01]);
    let mut engine = engine(fixture);
    let session = scan(&mut engine).await;

    assert_eq!(present_slots(&session).len(), 0x0B);
    assert_eq!(session.requests_in(Phase::InstancePresence), 0);
    assert_eq!(reads_of(&engine, 0x05, 0x00)[0], (0x02, 0x0000));
}
