//! `rec-sort` is a memory-bounded external merge sort for delimited records.
//!
//! External sorting handles datasets that do not fit into main memory. The
//! engine works in two passes: during the first pass it partitions the input
//! record stream into blocks whose encoded size stays under a computed byte
//! budget, sorts each block by a configured key column and persists it as a
//! sorted run; during the second pass it k-way merges the runs into a single
//! globally ordered stream. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **One configurable sort key:**
//!   records are ordered by the byte-lexicographic value of one column,
//!   selected by index. Equal keys resolve deterministically: stable within
//!   a block, then by run number during the merge.
//! * **Explicit memory budget:**
//!   the per-block budget is derived once per engine run from the available
//!   memory and a configured limit; the number of blocks in flight is capped
//!   so the pipeline never exceeds the budget.
//! * **Multithreading support:**
//!   blocks are sorted and persisted on a bounded worker pool; the merge
//!   phase is strictly sequential.
//! * **All-or-nothing:**
//!   any failure (unreadable source, oversized record, run write or read
//!   error) aborts the whole operation; partial output is never produced.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//! use std::path;
//!
//! use rec_sort::{ExternalSorter, ExternalSorterBuilder, MemoryLimit, Record, SortConfig};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("input.csv").unwrap());
//!     let mut output_writer = io::BufWriter::new(fs::File::create("output.csv").unwrap());
//!
//!     let config = SortConfig::new(0, MemoryLimit::Bytes(50 * 1024 * 1024), 512 * 1024 * 1024);
//!     let sorter: ExternalSorter<io::Error> = ExternalSorterBuilder::new(config)
//!         .with_tmp_dir(path::Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let sorted = sorter
//!         .sort(
//!             input_reader
//!                 .lines()
//!                 .map(|line| line.map(|line| Record::from_line(&line, ','))),
//!         )
//!         .unwrap();
//!
//!     for record in sorted.map(Result::unwrap) {
//!         output_writer
//!             .write_all(format!("{}\n", record.to_line(',')).as_bytes())
//!             .unwrap();
//!     }
//!     output_writer.flush().unwrap();
//! }
//! ```

pub mod block;
pub mod config;
pub mod merge;
pub mod partition;
pub mod record;
pub mod run;
pub mod sort;

pub use block::{Block, MissingKeyError};
pub use config::{ConfigError, MemoryLimit, SortConfig};
pub use merge::{MergeError, MergeState, RunMerger};
pub use partition::Partitioner;
pub use record::Record;
pub use run::{RmpRun, Run, RunError};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError};
