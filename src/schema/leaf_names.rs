//! Optional mapping of registers to myVaillant leaf names.
//!
//! The source is a CSV file with a `group,instance,register,leaf` header. An instance of `*`
//! applies the row to every instance of the group. Rows with an empty field are ignored and the
//! first row for a key wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::for_each_record;
use crate::plan;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the leaf name map at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("the leaf name map has no `{0}` column")]
    MissingColumn(&'static str),
    #[error("invalid {column} on line {line} of the leaf name map")]
    Field {
        #[source]
        source: plan::Error,
        column: &'static str,
        line: usize,
    },
}

const COLUMNS: [&str; 4] = ["group", "instance", "register", "leaf"];

#[derive(Clone, Debug, Default)]
pub struct LeafNames {
    exact: BTreeMap<(u8, u8, u16), String>,
    any_instance: BTreeMap<(u8, u16), String>,
}

impl LeafNames {
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let data = tokio::fs::read(path).await.map_err(|e| Error::Read(e, path.to_path_buf()))?;
        let names = Self::from_csv(&data)?;
        debug!(message = "loaded leaf names", path = ?path, entries = names.len());
        Ok(names)
    }

    pub fn from_csv(data: &[u8]) -> Result<Self, Error> {
        let mut names = Self::default();
        let mut columns: Option<[usize; 4]> = None;
        let mut line = 0;
        let mut result = Ok(());
        for_each_record(data, |fields| {
            line += 1;
            if result.is_err() {
                return;
            }
            match columns {
                None => match header_columns(fields) {
                    Ok(found) => columns = Some(found),
                    Err(error) => result = Err(error),
                },
                Some(found) => result = names.add_row(&found, fields, line),
            }
        });
        result?;
        if columns.is_none() {
            return Err(Error::MissingColumn(COLUMNS[0]));
        }
        Ok(names)
    }

    fn add_row(
        &mut self,
        columns: &[usize; 4],
        fields: &[String],
        line: usize,
    ) -> Result<(), Error> {
        let [group, instance, register, leaf] =
            columns.map(|c| fields.get(c).map(|f| f.trim()).unwrap_or_default());
        if group.is_empty() || instance.is_empty() || register.is_empty() || leaf.is_empty() {
            return Ok(());
        }
        let field =
            |column: &'static str| move |source: plan::Error| Error::Field { source, column, line };
        let group = plan::parse_id::<u8>(group).map_err(field("group"))?;
        let register = plan::parse_id::<u16>(register).map_err(field("register"))?;
        if instance == "*" {
            self.any_instance.entry((group, register)).or_insert_with(|| leaf.to_string());
            return Ok(());
        }
        let instance = plan::parse_id::<u8>(instance).map_err(field("instance"))?;
        self.exact.entry((group, instance, register)).or_insert_with(|| leaf.to_string());
        Ok(())
    }

    /// The leaf name of a register, preferring a row for this very instance over a `*` row.
    pub fn lookup(&self, group: u8, instance: u8, register: u16) -> Option<&str> {
        self.exact
            .get(&(group, instance, register))
            .or_else(|| self.any_instance.get(&(group, register)))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.any_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn header_columns(fields: &[String]) -> Result<[usize; 4], Error> {
    let mut columns = [0; 4];
    for (slot, name) in columns.iter_mut().zip(COLUMNS) {
        *slot = fields
            .iter()
            .position(|f| f.trim() == name)
            .ok_or(Error::MissingColumn(name))?;
    }
    Ok(columns)
}
