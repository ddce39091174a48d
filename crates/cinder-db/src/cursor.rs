use bson::Bson;
use serde::Serialize;

use crate::stats::ExecutionStats;

/// Extra information returned next to the rows of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extra {
    pub stats: ExecutionStats,
}

/// The fully materialized result of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cursor {
    #[serde(rename = "result")]
    rows: Vec<Bson>,
    extra: Extra,
}

impl Cursor {
    pub(crate) fn new(rows: Vec<Bson>, stats: ExecutionStats) -> Self {
        Self {
            rows,
            extra: Extra { stats },
        }
    }

    pub fn rows(&self) -> &[Bson] {
        &self.rows
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.extra.stats
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn into_rows(self) -> Vec<Bson> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl IntoIterator for Cursor {
    type Item = Bson;
    type IntoIter = std::vec::IntoIter<Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Cursor {
    type Item = &'a Bson;
    type IntoIter = std::slice::Iter<'a, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
