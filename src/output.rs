//! Rendering of register records and schema entries for the command line.

use std::path::PathBuf;

use csv_core::WriteResult;

use crate::b524;
use crate::schema::SchemaEntry;
use crate::session::{RecordStatus, RegisterRecord, hex_u8, hex_u16};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the row to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a CSV field")]
    EncodeCsv,
}

impl Args {
    pub fn new(output: Option<PathBuf>, format: Format) -> Self {
        Self { output, format }
    }

    pub fn into_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self, io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { header: Option<Vec<&'static str>> },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

pub const RECORD_HEADERS: [&str; 10] =
    ["GG", "II", "RR", "Name", "Type", "Value", "Label", "Raw", "TT", "Status"];

pub const SCHEMA_HEADERS: [&str; 5] = ["GG", "RR", "Name", "Type", "Values"];

impl Output {
    pub fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match args.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { header: None },
        };
        Self { args, io, formatter }
    }

    /// Set the column headers. Must precede the first row.
    pub fn table_headers(&mut self, headers: &[&'static str]) {
        match &mut self.formatter {
            Formatter::Csv { header } => *header = Some(headers.to_vec()),
            Formatter::Table { comfy } => {
                comfy.set_header(headers.to_vec());
            }
            Formatter::Jsonl => {}
        }
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut buffer = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        let mut line = Vec::new();
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                let (WriteResult::InputEmpty, n) = writer.delimiter(&mut buffer) else {
                    return Err(Error::EncodeCsv);
                };
                line.extend_from_slice(&buffer[..n]);
            }
            let (WriteResult::InputEmpty, _, n) =
                writer.field(value.as_ref().as_bytes(), &mut buffer)
            else {
                return Err(Error::EncodeCsv);
            };
            line.extend_from_slice(&buffer[..n]);
        }
        let (WriteResult::InputEmpty, n) = writer.terminator(&mut buffer) else {
            return Err(Error::EncodeCsv);
        };
        line.extend_from_slice(&buffer[..n]);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    /// Emit one row: `table_row` for tabular formats, `serde_record` for JSON lines.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { header } => {
                if let Some(header) = header.take() {
                    self.write_csv_row(&header)?;
                }
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    pub fn record(&mut self, record: &RegisterRecord) -> Result<(), Error> {
        self.result(|| record_row(record), || RecordLine::from(record))
    }

    pub fn schema_entry(&mut self, entry: &SchemaEntry) -> Result<(), Error> {
        self.result(
            || {
                let values = entry.enum_table.as_ref().map(|table| {
                    table.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";")
                });
                vec![
                    hex_u8(entry.group),
                    hex_u16(entry.register),
                    entry.semantic_path.clone(),
                    entry.wire_type.map(|t| t.to_string()).unwrap_or_default(),
                    values.unwrap_or_default(),
                ]
            },
            || entry,
        )
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            let rendered = format!("{comfy}\n");
            self.io.write_all(rendered.as_bytes()).map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

fn record_row(record: &RegisterRecord) -> Vec<String> {
    let status = match record.status {
        RecordStatus::Ok => "ok".to_string(),
        _ => format!("{:?}: {}", record.status, record.error.as_deref().unwrap_or_default()),
    };
    vec![
        hex_u8(record.group),
        hex_u8(record.instance),
        hex_u16(record.register),
        record.semantic_name.clone().unwrap_or_default(),
        record.wire_type.map(|t| t.to_string()).unwrap_or_default(),
        record.value.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        record.enum_label.clone().unwrap_or_default(),
        b524::encode_hex(&record.raw_bytes),
        record
            .reply_status
            .map(|tt| format!("{tt:#04x} {}", b524::ReplyStatus::describe(tt)))
            .unwrap_or_default(),
        status,
    ]
}

/// The JSON lines shape of a record.
#[derive(serde::Serialize)]
struct RecordLine<'a> {
    group: String,
    instance: String,
    register: String,
    opcode: b524::RegisterOpcode,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    myvaillant_name: Option<&'a str>,
    #[serde(rename = "type")]
    wire_type: Option<crate::value::WireType>,
    value: Option<&'a crate::value::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enum_label: Option<&'a str>,
    raw_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tt: Option<u8>,
    status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> From<&'a RegisterRecord> for RecordLine<'a> {
    fn from(r: &'a RegisterRecord) -> Self {
        Self {
            group: hex_u8(r.group),
            instance: hex_u8(r.instance),
            register: hex_u16(r.register),
            opcode: r.opcode,
            name: r.semantic_name.as_deref(),
            myvaillant_name: r.leaf_name.as_deref(),
            wire_type: r.wire_type,
            value: r.value.as_ref(),
            enum_label: r.enum_label.as_deref(),
            raw_hex: b524::encode_hex(&r.raw_bytes),
            tt: r.reply_status,
            status: r.status,
            error: r.error.as_deref(),
        }
    }
}
