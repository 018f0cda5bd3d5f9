//! Values stored under one composite identifier.

use serde::Serialize;

use super::keyed::Keyed;
use super::record::Record;

/// A single row, or the rows sharing a grouped identifier keyed by sub-key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entry {
    Row(Record),
    Group(Keyed<Record>),
}

impl Entry {
    /// Decodes a cached entry. The shape is known from the caller's grouping setting, so the
    /// JSON is never guessed at.
    pub fn decode(raw: &str, grouped: bool) -> Result<Self, serde_json::Error> {
        if grouped {
            serde_json::from_str::<Keyed<Record>>(raw).map(Self::Group)
        } else {
            serde_json::from_str::<Record>(raw).map(Self::Row)
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        match self {
            Self::Row(_) => 1,
            Self::Group(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<&Record> {
        match self {
            Self::Row(record) => vec![record],
            Self::Group(rows) => rows.iter().map(|(_, record)| record).collect(),
        }
    }

    pub fn for_each_record_mut(&mut self, mut apply: impl FnMut(&mut Record)) {
        match self {
            Self::Row(record) => apply(record),
            Self::Group(rows) => {
                let ids: Vec<String> = rows.keys().map(str::to_string).collect();
                for id in ids {
                    if let Some(record) = rows.get_mut(&id) {
                        apply(record);
                    }
                }
            }
        }
    }

    /// Drops rows failing `keep`. Returns whether anything is left.
    pub fn retain_records(&mut self, keep: impl Fn(&Record) -> bool) -> bool {
        match self {
            Self::Row(record) => keep(record),
            Self::Group(rows) => {
                rows.retain(|_, record| keep(record));
                !rows.is_empty()
            }
        }
    }
}
