//! Register metadata loaded from ebusd configuration CSV files (e.g. `15.720.csv`).
//!
//! Only B524 register read rows contribute entries. Lookups are by `(group, register)`: all
//! instances of a group share one field layout. A [`LeafNames`] map attached with
//! [`Schema::with_leaf_names`] adds per-instance myVaillant names on top.

pub mod context;
pub mod leaf_names;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv_core::ReadRecordResult;
use tracing::{debug, warn};

use crate::b524::{Optype, Selector};
use crate::value::{Value, WireType};

pub use leaf_names::LeafNames;

/// Columns of an ebusd message row:
/// `type,circuit,level,name,comment,QQ,ZZ,PBSB,ID,field,part,type,divider/values,unit,comment`.
const NAME_COLUMN: usize = 3;
const CIRCUIT_COLUMN: usize = 1;
/// The data type of the first field of the message.
const TYPE_COLUMN: usize = 11;
const VALUES_COLUMN: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the schema at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SchemaEntry {
    pub group: u8,
    pub register: u16,
    /// `None` when the row carries no recognizable type tag; the reply is then type-inferred.
    pub wire_type: Option<WireType>,
    pub semantic_path: String,
    pub enum_table: Option<BTreeMap<i64, String>>,
}

impl SchemaEntry {
    /// Label for an enum-typed value. Values outside of the table get a placeholder label.
    pub fn enum_label(&self, value: &Value) -> Option<String> {
        let table = self.enum_table.as_ref()?;
        let n = value.as_integer()?;
        Some(match table.get(&n) {
            Some(label) => label.clone(),
            None => unknown_enum_label(n),
        })
    }
}

pub fn unknown_enum_label(value: i64) -> String {
    format!("UNKNOWN_{value}")
}

/// Counters describing how a schema source was digested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub registers: usize,
    pub duplicates: usize,
    pub timers_skipped: usize,
    pub writes_skipped: usize,
    pub rejected: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Schema {
    entries: BTreeMap<(u8, u16), SchemaEntry>,
    leaf_names: LeafNames,
    stats: LoadStats,
}

impl Schema {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let data = tokio::fs::read(path).await.map_err(|e| Error::Read(e, path.to_path_buf()))?;
        let schema = Self::from_csv(&data);
        debug!(message = "loaded schema", path = ?path, stats = ?schema.stats);
        Ok(schema)
    }

    pub fn from_csv(data: &[u8]) -> Self {
        let mut schema = Self::default();
        for_each_record(data, |fields| schema.add_row(fields));
        schema
    }

    fn add_row(&mut self, fields: &[String]) {
        let Some(first) = fields.first() else { return };
        if first.trim_start().starts_with('#') {
            return;
        }
        self.stats.rows += 1;
        let name = fields.get(NAME_COLUMN).map(|s| s.trim()).unwrap_or_default();
        if name.is_empty() {
            return;
        }
        let Some(id) = b524_id(fields) else { return };
        let selector = match Selector::from_id(id) {
            Ok(Selector::Register(selector)) => selector,
            Ok(Selector::Timer(_)) => {
                self.stats.timers_skipped += 1;
                return;
            }
            Ok(Selector::Directory { .. }) => return,
            Err(error) => {
                warn!(message = "rejecting schema row", name, id, %error);
                self.stats.rejected += 1;
                return;
            }
        };
        if selector.optype == Optype::Write {
            self.stats.writes_skipped += 1;
            return;
        }
        let circuit = fields.get(CIRCUIT_COLUMN).map(|s| s.trim()).unwrap_or_default();
        let semantic_path =
            if circuit.is_empty() { name.to_string() } else { format!("{circuit}.{name}") };
        let entry = SchemaEntry {
            group: selector.group,
            register: selector.register,
            wire_type: fields.get(TYPE_COLUMN).and_then(|f| f.parse::<WireType>().ok()),
            semantic_path,
            enum_table: fields.get(VALUES_COLUMN).and_then(|f| parse_enum_table(f)),
        };
        match self.entries.entry((selector.group, selector.register)) {
            std::collections::btree_map::Entry::Occupied(_) => self.stats.duplicates += 1,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                self.stats.registers += 1;
            }
        }
    }

    pub fn lookup(&self, group: u8, register: u16) -> Option<&SchemaEntry> {
        self.entries.get(&(group, register))
    }

    pub fn with_leaf_names(mut self, leaf_names: LeafNames) -> Self {
        self.leaf_names = leaf_names;
        self
    }

    pub fn leaf_name(&self, group: u8, instance: u8, register: u16) -> Option<&str> {
        self.leaf_names.lookup(group, instance, register)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }
}

/// Find the hex selector of a B524 row: either a single `b524,<hex>` field or a `b524` field
/// followed by the hex id in the next one.
fn b524_id(fields: &[String]) -> Option<&str> {
    for (index, field) in fields.iter().enumerate() {
        let field = field.trim();
        match field.split_once(',') {
            Some((prefix, id)) if prefix.trim().eq_ignore_ascii_case("b524") => {
                return Some(id.trim());
            }
            _ => {}
        }
        if field.eq_ignore_ascii_case("b524") {
            let candidate = fields.get(index + 1)?.trim();
            let is_hex = !candidate.is_empty()
                && candidate.len() % 2 == 0
                && candidate.bytes().all(|b| b.is_ascii_hexdigit());
            if is_hex {
                return Some(candidate);
            }
        }
    }
    None
}

/// `0=off;1=on;2=auto`
fn parse_enum_table(field: &str) -> Option<BTreeMap<i64, String>> {
    let field = field.trim();
    if !field.contains('=') {
        return None;
    }
    let mut table = BTreeMap::new();
    for pair in field.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, label) = pair.split_once('=')?;
        let key = key.trim().parse::<i64>().ok()?;
        table.insert(key, label.trim().to_string());
    }
    (!table.is_empty()).then_some(table)
}

fn for_each_record(mut input: &[u8], mut on_record: impl FnMut(&[String])) {
    let mut reader = csv_core::Reader::new();
    let mut output = vec![0; 1024];
    let mut ends = vec![0; 32];
    let mut fields = Vec::new();
    let (mut outlen, mut endlen) = (0, 0);
    loop {
        let (result, nin, nout, nend) =
            reader.read_record(input, &mut output[outlen..], &mut ends[endlen..]);
        input = &input[nin..];
        outlen += nout;
        endlen += nend;
        match result {
            ReadRecordResult::InputEmpty => continue,
            ReadRecordResult::OutputFull => output.resize(output.len() * 2, 0),
            ReadRecordResult::OutputEndsFull => ends.resize(ends.len() * 2, 0),
            ReadRecordResult::Record => {
                fields.clear();
                let mut start = 0;
                for &end in &ends[..endlen] {
                    fields.push(String::from_utf8_lossy(&output[start..end]).into_owned());
                    start = end;
                }
                on_record(&fields);
                outlen = 0;
                endlen = 0;
            }
            ReadRecordResult::End => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CSV: &str = "\
# type,circuit,level,name,comment,QQ,ZZ,PBSB,ID,field,part,type,divider/values,unit,comment
r,,,HwcTempDesired,desired temp,,15,b524,020001000400,,s,EXP,,°C,
r,Hc,,HeatingCurve,,,15,b524,020002000f00,,s,UIN,,,
r,Zone,,OpMode,,,15,b524,020003001600,,s,UCH,\"0=off;1=auto;2=day\",,
w,Zone,,OpMode,,,15,b524,010003001600,,s,UCH,,,
w,Zone,,OpModeSet,,,15,b524,020103001600,,s,UCH,,,
r,Timer,,Monday,,,15,b524,0300000100,,s,HEX:4,,,
r,,,Bogus,,,15,b524,0900,,s,UCH,,,
r,Hc,,HeatingCurveAgain,,,15,b524,020002000f00,,s,I16,,,
r,,,Untyped,,,15,\"b524,060009000700\",,,,,,
r,,,Commented,UCH,,15,b524,020002001000,,s,EXP,,,UIN
r,,,CommentOnly,UIN,,15,b524,020002001100,,s,,,,I16
";

    #[test]
    fn loads_register_rows() {
        let schema = Schema::from_csv(CSV.as_bytes());
        let stats = schema.stats();
        assert_eq!(schema.len(), 6);
        assert_eq!(stats.timers_skipped, 1);
        assert_eq!(stats.writes_skipped, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.duplicates, 1);

        let hwc = schema.lookup(0x01, 0x0004).unwrap();
        assert_eq!(hwc.semantic_path, "HwcTempDesired");
        assert_eq!(hwc.wire_type, Some(WireType::Float32));

        let curve = schema.lookup(0x02, 0x000F).unwrap();
        assert_eq!(curve.semantic_path, "Hc.HeatingCurve");
        assert_eq!(curve.wire_type, Some(WireType::U16));

        let untyped = schema.lookup(0x09, 0x0007).unwrap();
        assert_eq!(untyped.wire_type, None);
    }

    #[test]
    fn type_comes_from_the_type_column() {
        let schema = Schema::from_csv(CSV.as_bytes());
        assert_eq!(schema.lookup(0x02, 0x0010).unwrap().wire_type, Some(WireType::Float32));
        assert_eq!(schema.lookup(0x02, 0x0011).unwrap().wire_type, None);
    }

    #[test]
    fn enum_labels_fall_back_to_placeholder() {
        let schema = Schema::from_csv(CSV.as_bytes());
        let op_mode = schema.lookup(0x03, 0x0016).unwrap();
        assert_eq!(op_mode.enum_label(&Value::Integer(1)), Some("auto".to_string()));
        assert_eq!(op_mode.enum_label(&Value::Integer(7)), Some("UNKNOWN_7".to_string()));
        assert_eq!(op_mode.enum_label(&Value::Absent), None);
        let curve = schema.lookup(0x02, 0x000F).unwrap();
        assert_eq!(curve.enum_label(&Value::Integer(1)), None);
    }

    #[test]
    fn long_fields_grow_buffers() {
        let long = "x".repeat(5000);
        let fields = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let data = format!("r,,,{long},,,15,b524,020001000100,,s,UCH,,,\n{fields}\n");
        let mut seen = Vec::new();
        for_each_record(data.as_bytes(), |f| seen.push(f.len()));
        assert_eq!(seen, vec![15, 100]);
        let schema = Schema::from_csv(data.as_bytes());
        assert_eq!(schema.lookup(0x01, 0x0001).unwrap().semantic_path, long);
    }
}
