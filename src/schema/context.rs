//! Heating circuit enum registers whose meaning depends on the rest of the installation.
//!
//! The same raw value of a circuit's mixer type reads differently depending on whether the
//! circuit cools, whether the system has cylinders and which system schema is configured.

pub const CIRCUIT_GROUP: u8 = 0x02;
pub const CIRCUIT_TYPE: u16 = 0x0001;
pub const MIXER_CIRCUIT_TYPE: u16 = 0x0002;
pub const ROOM_INFLUENCE_TYPE: u16 = 0x0003;
pub const COOLING_ENABLED: u16 = 0x0006;

/// `GG=0x00 II=0x00 RR=0x0001`.
pub const SYSTEM_SCHEMA: (u8, u8, u16) = (0x00, 0x00, 0x0001);
pub const CYLINDER_GROUP: u8 = 0x05;

/// System schemas that can drive a pool.
const POOL_SCHEMAS: [i64; 4] = [8, 9, 12, 13];

/// A raw enum name and the name it resolves to in context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextualEnum {
    pub raw_name: String,
    pub resolved_name: String,
}

impl ContextualEnum {
    fn new(raw_name: &str, resolved_name: &str) -> Self {
        Self { raw_name: raw_name.to_string(), resolved_name: resolved_name.to_string() }
    }

    fn unknown(raw: i64) -> Self {
        let name = super::unknown_enum_label(raw);
        Self { raw_name: name.clone(), resolved_name: name }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CircuitContext {
    /// The configured system schema, if it was read.
    pub system_schema: Option<i64>,
    pub cylinders_present: bool,
    pub pool_sensor_present: bool,
    /// The circuit's own cooling flag.
    pub cooling_enabled: Option<i64>,
}

/// Resolve the value of a context dependent circuit register. `None` for any other register.
pub fn resolve(register: u16, raw: i64, context: &CircuitContext) -> Option<ContextualEnum> {
    Some(match register {
        CIRCUIT_TYPE => circuit_type(raw),
        MIXER_CIRCUIT_TYPE => mixer_circuit_type(raw, context),
        ROOM_INFLUENCE_TYPE => room_influence_type(raw),
        _ => return None,
    })
}

fn circuit_type(raw: i64) -> ContextualEnum {
    match raw {
        1 => ContextualEnum::new("DIRECT_HEATING_CIRCUIT", "DIRECT_HEATING_CIRCUIT"),
        2 => ContextualEnum::new("MIXER_CIRCUIT_EXTERNAL", "MIXER_CIRCUIT_EXTERNAL"),
        _ => ContextualEnum::unknown(raw),
    }
}

fn mixer_circuit_type(raw: i64, context: &CircuitContext) -> ContextualEnum {
    match raw {
        0 => ContextualEnum::new("INACTIVE", "INACTIVE"),
        1 => {
            let cooling = context.cooling_enabled == Some(1);
            let resolved = if cooling { "COOLING" } else { "HEATING" };
            ContextualEnum::new("HEATING_OR_COOLING", resolved)
        }
        2 => {
            let pool_schema = context.system_schema.is_some_and(|s| POOL_SCHEMAS.contains(&s));
            let pool = pool_schema && context.pool_sensor_present;
            let resolved = if pool { "POOL" } else { "FIXED_VALUE" };
            ContextualEnum::new("FIXED_VALUE_OR_POOL", resolved)
        }
        3 => {
            let resolved = if context.cylinders_present { "CYLINDER_CHARGING" } else { "DHW" };
            ContextualEnum::new("DHW_OR_CYLINDER_CHARGING", resolved)
        }
        4 => ContextualEnum::new("RETURN_INCREASE", "RETURN_INCREASE"),
        _ => ContextualEnum::unknown(raw),
    }
}

fn room_influence_type(raw: i64) -> ContextualEnum {
    match raw {
        0 => ContextualEnum::new("INACTIVE", "INACTIVE"),
        1 => ContextualEnum::new("ACTIVE", "ACTIVE"),
        2 => ContextualEnum::new("EXTENDED", "EXTENDED"),
        _ => ContextualEnum::unknown(raw),
    }
}
