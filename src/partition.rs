//! Source partitioning into budget-bounded blocks.

use std::error::Error;

use log;

use crate::block::Block;
use crate::record::Record;
use crate::sort::SortError;

/// Partitions a fallible record stream into blocks whose accumulated
/// encoded size stays under the byte budget.
///
/// The source is consumed sequentially and irreversibly. A record that does
/// not fit the current block is held in a lookahead slot and opens the next
/// one, so no record is ever lost at a block boundary.
pub struct Partitioner<I> {
    source: I,
    budget: u64,
    lookahead: Option<(Record, u64)>,
    next_index: usize,
}

impl<I, E> Partitioner<I>
where
    I: Iterator<Item = Result<Record, E>>,
    E: Error,
{
    /// Creates a partitioner over `source`. `budget` is the precomputed
    /// per-block byte ceiling (see [`SortConfig::block_budget`]).
    ///
    /// [`SortConfig::block_budget`]: crate::config::SortConfig::block_budget
    pub fn new(source: I, budget: u64) -> Self {
        Partitioner {
            source,
            budget,
            lookahead: None,
            next_index: 0,
        }
    }

    /// Builds the next block, or returns [`None`] once the source is
    /// exhausted. The final block may be smaller than the budget.
    ///
    /// A single record whose encoded size reaches the budget is fatal:
    /// a block cannot be split at sub-record granularity.
    pub fn next_block(&mut self) -> Result<Option<Block>, SortError<E>> {
        let mut block = Block::new(self.next_index);

        while let Some((record, size)) = self.take_record()? {
            if size >= self.budget {
                return Err(SortError::OversizedRecord {
                    block_index: block.index(),
                    record_size: size,
                    budget: self.budget,
                });
            }

            if block.fits(size, self.budget) {
                block.push(record, size);
            } else {
                self.lookahead = Some((record, size));
                break;
            }
        }

        if block.is_empty() {
            return Ok(None);
        }

        self.next_index += 1;
        log::debug!(
            "partitioned block {} ({} records, {} bytes)",
            block.index(),
            block.len(),
            block.encoded_size()
        );
        Ok(Some(block))
    }

    fn take_record(&mut self) -> Result<Option<(Record, u64)>, SortError<E>> {
        if let Some(held) = self.lookahead.take() {
            return Ok(Some(held));
        }

        match self.source.next() {
            Some(Ok(record)) => {
                let size = record.encoded_size();
                Ok(Some((record, size)))
            }
            Some(Err(err)) => Err(SortError::Read(err)),
            None => Ok(None),
        }
    }
}
