//! Parsing of ids and id sets given on the command line.
//!
//! Ids are decimal unless prefixed with `0x`. Sets are comma separated ids and inclusive
//! ranges: `0-3,7,0x0a`.

use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("`{0}` is not a valid id")]
    Id(String),
    #[error("`{0}` is out of range")]
    OutOfRange(String),
    #[error("range `{0}` ends before it starts")]
    Reversed(String),
    #[error("the id set is empty")]
    Empty,
}

pub fn parse_id<T: TryFrom<u32>>(text: &str) -> Result<T, Error> {
    let trimmed = text.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => trimmed.parse::<u32>(),
    };
    let value = parsed.map_err(|_| Error::Id(text.to_string()))?;
    T::try_from(value).map_err(|_| Error::OutOfRange(text.to_string()))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdSet(BTreeSet<u8>);

impl IdSet {
    pub fn contains(&self, id: u8) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u8> for IdSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for IdSet {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let mut ids = BTreeSet::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_id::<u8>(start)?;
                    let end = parse_id::<u8>(end)?;
                    if end < start {
                        return Err(Error::Reversed(part.to_string()));
                    }
                    ids.extend(start..=end);
                }
                None => {
                    ids.insert(parse_id::<u8>(part)?);
                }
            }
        }
        if ids.is_empty() {
            return Err(Error::Empty);
        }
        Ok(Self(ids))
    }
}

pub fn parse_id_set(text: &str) -> Result<IdSet, Error> {
    text.parse()
}
