use crate::b524::RegisterOpcode;

/// How an instance slot of an instanced group is judged to be populated.
///
/// Each rule names the registers it probes and how their replies are judged. See
/// [`crate::discovery`] for the evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceRule {
    /// Register `0x0002` as `UIN` holds something other than `0x0000` or `0xFFFF`.
    HeatingCircuit,
    /// Register `0x001C` as `UCH` holds something other than `0xFF`.
    Zone,
    /// Register `0x0007` or `0x000F` as `EXP` holds a non-NaN value, always probed remotely.
    RemoteSensor,
    /// Any register of [`GENERIC_PRESENCE_PROBES`] answers with data.
    AnyResponse,
    /// Every slot in range is populated. Nothing is probed.
    Always,
}

pub const GENERIC_PRESENCE_PROBES: [u16; 4] = [0x0002, 0x0007, 0x000F, 0x0016];

pub const UNKNOWN_GROUP_II_MAX: u8 = 0x0A;
pub const UNKNOWN_GROUP_RR_MAX: u16 = 0x0030;
pub const UNKNOWN_GROUP_NAME: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// One implicit instance, `0x00`.
    Singleton,
    /// Descriptor `1.0`: instances `0..=ii_max` need a presence check.
    Instanced,
    /// A descriptor nobody has documented yet. Scanned like a singleton.
    Unrecognized,
}

impl Classification {
    pub fn of(descriptor: f32) -> Self {
        if descriptor == 1.0 {
            Self::Instanced
        } else if KNOWN_GROUPS.iter().any(|g| g.descriptor == Some(descriptor)) {
            Self::Singleton
        } else {
            Self::Unrecognized
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupProfile {
    pub group: u8,
    /// The descriptor this group is expected to report in the directory.
    pub descriptor: Option<f32>,
    pub name: &'static str,
    pub opcode: RegisterOpcode,
    pub ii_max: u8,
    pub rr_max: u16,
    pub presence: PresenceRule,
    pub known: bool,
}

impl GroupProfile {
    /// The profile for `group`, falling back to generic bounds for groups not in the table.
    pub fn lookup(group: u8) -> Self {
        match KNOWN_GROUPS.binary_search_by_key(&group, |g| g.group) {
            Ok(index) => KNOWN_GROUPS[index],
            Err(_) => Self {
                group,
                descriptor: None,
                name: UNKNOWN_GROUP_NAME,
                opcode: RegisterOpcode::Local,
                ii_max: UNKNOWN_GROUP_II_MAX,
                rr_max: UNKNOWN_GROUP_RR_MAX,
                presence: PresenceRule::AnyResponse,
                known: false,
            },
        }
    }
}

macro_rules! for_each_group {
    ($m:ident) => {
        $m! {
            0x00: 3.0, Local, 0x00, 0x00FF, AnyResponse, "Regulator Parameters";
            0x01: 3.0, Local, 0x00, 0x001F, AnyResponse, "Hot Water Circuit";
            0x02: 1.0, Local, 0x0A, 0x0025, HeatingCircuit, "Heating Circuits";
            0x03: 1.0, Local, 0x0A, 0x002F, Zone, "Zones";
            0x04: 6.0, Local, 0x00, 0x000F, AnyResponse, "Solar Circuit";
            0x05: 1.0, Local, 0x0A, 0x000F, Always, "Hot Water Cylinder";
            0x09: 1.0, Remote, 0x0A, 0x002F, RemoteSensor, "RoomSensors";
            0x0A: 1.0, Remote, 0x0A, 0x003F, RemoteSensor, "RoomState";
            0x0C: 1.0, Remote, 0x0A, 0x003F, AnyResponse, "Unrecognized";
        }
    };
}

macro_rules! make_table {
    ($(
        $group: literal: $desc: literal, $opcode: ident, $ii: literal, $rr: literal,
        $rule: ident, $name: literal;
    )+) => {
        pub const KNOWN_GROUPS: &[GroupProfile] = &[$(GroupProfile {
            group: $group,
            descriptor: Some($desc),
            name: $name,
            opcode: RegisterOpcode::$opcode,
            ii_max: $ii,
            rr_max: $rr,
            presence: PresenceRule::$rule,
            known: true,
        }),*];
    };
}

for_each_group!(make_table);

const _: () = {
    let mut index = 1;
    while index < KNOWN_GROUPS.len() {
        if KNOWN_GROUPS[index - 1].group >= KNOWN_GROUPS[index].group {
            panic!("KNOWN_GROUPS is not sorted (or has duplicate values)!");
        }
        index += 1;
    }
};
