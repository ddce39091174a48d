use std::iter::Sum;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Counters reported with every query result.
///
/// Per-shard statistics are combined with [`ExecutionStats::merge`], an
/// element-wise sum. `execution_time` is the wall time of the whole
/// statement and is set once by the coordinator; merging keeps the larger
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub writes_executed: u64,
    pub writes_ignored: u64,
    pub scanned_full: u64,
    pub scanned_index: u64,
    pub filtered: u64,
    pub execution_time: f64,
}

impl ExecutionStats {
    pub fn merge(&mut self, other: &ExecutionStats) {
        self.writes_executed += other.writes_executed;
        self.writes_ignored += other.writes_ignored;
        self.scanned_full += other.scanned_full;
        self.scanned_index += other.scanned_index;
        self.filtered += other.filtered;
        self.execution_time = self.execution_time.max(other.execution_time);
    }

    /// `(writesExecuted, writesIgnored)`.
    pub fn writes(&self) -> (u64, u64) {
        (self.writes_executed, self.writes_ignored)
    }
}

impl AddAssign for ExecutionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.merge(&rhs);
    }
}

impl<'a> AddAssign<&'a ExecutionStats> for ExecutionStats {
    fn add_assign(&mut self, rhs: &'a ExecutionStats) {
        self.merge(rhs);
    }
}

impl Sum for ExecutionStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ExecutionStats::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(executed: u64, ignored: u64) -> ExecutionStats {
        ExecutionStats {
            writes_executed: executed,
            writes_ignored: ignored,
            ..Default::default()
        }
    }

    #[test]
    fn merge_sums_counters() {
        let total: ExecutionStats = vec![stats(1, 4), stats(20, 0), stats(0, 3)]
            .into_iter()
            .sum();
        assert_eq!(total.writes(), (21, 7));
    }

    #[test]
    fn merge_is_associative() {
        let (a, b, c) = (stats(1, 2), stats(3, 4), stats(5, 6));
        let mut left = a;
        left += b;
        left += c;
        let mut bc = b;
        bc += c;
        let mut right = a;
        right += bc;
        assert_eq!(left, right);
    }

    #[test]
    fn serializes_camel_case() {
        let doc = bson::serialize_to_document(&stats(1, 0)).unwrap();
        assert_eq!(doc.get_i64("writesExecuted").unwrap(), 1);
        assert_eq!(doc.get_i64("writesIgnored").unwrap(), 0);
    }
}
