//! Budget-bounded record blocks and in-place block sorting.

use std::error::Error;
use std::fmt;

use rayon::slice::ParallelSliceMut;

use crate::record::Record;

/// A record with no field at the configured key column. Fatal for the whole
/// sort: skipping the record would silently break the output permutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingKeyError {
    /// Block the record was accumulated into.
    pub block_index: usize,
    /// Position of the record within the block.
    pub record_index: usize,
    /// The configured key column.
    pub column: usize,
}

impl fmt::Display for MissingKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} in block {} has no key column {}",
            self.record_index, self.block_index, self.column
        )
    }
}

impl Error for MissingKeyError {}

/// In-memory batch of records bounded by an encoded-byte budget.
///
/// A block is created empty, filled by the partitioner, sorted once and then
/// consumed into a run. Its accumulated size never reaches the budget.
#[derive(Debug)]
pub struct Block {
    records: Vec<Record>,
    encoded_size: u64,
    index: usize,
}

impl Block {
    pub(crate) fn new(index: usize) -> Self {
        Block {
            records: Vec::new(),
            encoded_size: 0,
            index,
        }
    }

    /// Whether a record of `size` encoded bytes still fits under `budget`.
    pub fn fits(&self, size: u64, budget: u64) -> bool {
        self.encoded_size + size < budget
    }

    pub(crate) fn push(&mut self, record: Record, size: u64) {
        self.encoded_size += size;
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Accumulated encoded byte size of the block's records.
    pub fn encoded_size(&self) -> u64 {
        self.encoded_size
    }

    /// Zero-based position of the block in source order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sorts the block in place by the key column, byte order ascending.
    ///
    /// The sort is stable: records with equal keys keep their source order
    /// within the block. Every record is validated to carry the key column
    /// before sorting starts.
    pub fn sort_by_column(&mut self, column: usize) -> Result<(), MissingKeyError> {
        if let Some(record_index) = self.records.iter().position(|r| r.key(column).is_none()) {
            return Err(MissingKeyError {
                block_index: self.index,
                record_index,
                column,
            });
        }

        self.records.par_sort_by(|a, b| {
            a.key(column)
                .unwrap_or_default()
                .cmp(b.key(column).unwrap_or_default())
        });

        Ok(())
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
mod test {
    use super::Block;
    use crate::record::Record;

    fn record(fields: &[&str]) -> Record {
        Record::new(fields.iter().map(|f| f.to_string()).collect())
    }

    #[test]
    fn test_budget_accounting() {
        let mut block = Block::new(0);
        assert!(block.is_empty());

        let first = record(&["ab"]); // 3 encoded bytes
        assert!(block.fits(first.encoded_size(), 8));
        let size = first.encoded_size();
        block.push(first, size);
        assert_eq!(block.encoded_size(), 3);

        let second = record(&["cd"]);
        assert!(block.fits(second.encoded_size(), 8));
        let size = second.encoded_size();
        block.push(second, size);
        assert_eq!(block.encoded_size(), 6);

        // 6 + 3 >= 8: the next record would overflow the budget
        assert!(!block.fits(3, 8));
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_sort_by_column() {
        let mut block = Block::new(0);
        for fields in [["b", "1"], ["a", "2"], ["c", "3"], ["a", "4"]] {
            let rec = record(&fields);
            let size = rec.encoded_size();
            block.push(rec, size);
        }

        block.sort_by_column(0).unwrap();

        let keys: Vec<&str> = block.records.iter().map(|r| r.fields()[1].as_str()).collect();
        // stable: the two "a" records keep their source order
        assert_eq!(keys, vec!["2", "4", "1", "3"]);
    }

    #[test]
    fn test_sort_missing_key_column() {
        let mut block = Block::new(7);
        let rec = record(&["a", "b"]);
        let size = rec.encoded_size();
        block.push(rec, size);
        let short = record(&["only"]);
        let size = short.encoded_size();
        block.push(short, size);

        let err = block.sort_by_column(1).unwrap_err();
        assert_eq!(err.block_index, 7);
        assert_eq!(err.record_index, 1);
        assert_eq!(err.column, 1);
    }
}
