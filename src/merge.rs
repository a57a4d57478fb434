//! Deterministic k-way run merge.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use log;

use crate::record::Record;
use crate::run::Run;

/// Merge failure. Any unrecoverable run error aborts the whole merge:
/// global ordering cannot be guaranteed once a run is untrustworthy.
#[derive(Debug)]
pub enum MergeError {
    /// Reading a record from an open run failed.
    RunRead {
        run_index: usize,
        source: Box<dyn Error + Send + Sync>,
    },
    /// A run yielded a record without the key column.
    MissingKey { run_index: usize, column: usize },
    /// The operation was cancelled between merge steps.
    Cancelled,
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::RunRead { run_index, source } => {
                write!(f, "reading run {} failed: {}", run_index, source)
            }
            MergeError::MissingKey { run_index, column } => {
                write!(f, "run {} yielded a record without key column {}", run_index, column)
            }
            MergeError::Cancelled => write!(f, "merge cancelled"),
        }
    }
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MergeError::RunRead { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Merge progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Frontier not seeded yet.
    Initializing,
    /// Emitting records.
    Merging,
    /// All runs drained.
    Completed,
    /// Aborted by a run error or cancellation. The iterator is fused.
    Failed,
}

/// One open run's head on the merge frontier. Ordered by head key bytes,
/// then by run number so equal keys resolve deterministically to the
/// lowest-numbered run.
struct FrontierEntry {
    key: Vec<u8>,
    run_slot: usize,
    record: Record,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run_slot == other.run_slot
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.run_slot.cmp(&other.run_slot))
    }
}

/// K-way merger over sorted runs. Yields the globally ordered record stream
/// as an iterator; strictly sequential, *m* \* log(*n*) time for *m* records
/// over *n* runs.
pub struct RunMerger<R: Run> {
    /// Open runs; a slot becomes [`None`] once its run is drained and closed.
    runs: Vec<Option<R>>,
    /// Min-heap over the open runs' head records.
    frontier: BinaryHeap<Reverse<FrontierEntry>>,
    key_column: usize,
    cancel: Option<Arc<AtomicBool>>,
    state: MergeState,
}

impl<R: Run> RunMerger<R> {
    /// Creates a merger over `runs`. Each run must be individually sorted;
    /// the supplied order is irrelevant, runs are arranged by run number so
    /// that the equal-key tie-break always favors the lowest-numbered run.
    pub fn new(runs: Vec<R>, key_column: usize) -> Self {
        Self::with_cancel(runs, key_column, None)
    }

    pub(crate) fn with_cancel(
        mut runs: Vec<R>,
        key_column: usize,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        runs.sort_by_key(R::index);
        let frontier = BinaryHeap::with_capacity(runs.len());
        RunMerger {
            runs: Vec::from_iter(runs.into_iter().map(Some)),
            frontier,
            key_column,
            cancel,
            state: MergeState::Initializing,
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Pulls the next head from the run in `slot`, closing the run once it
    /// is exhausted.
    fn pull(&mut self, slot: usize) -> Result<Option<FrontierEntry>, MergeError> {
        let run = match self.runs[slot].as_mut() {
            Some(run) => run,
            None => return Ok(None),
        };
        let run_index = run.index();

        match run.next_record() {
            Ok(Some(record)) => {
                let key = record
                    .key(self.key_column)
                    .ok_or(MergeError::MissingKey {
                        run_index,
                        column: self.key_column,
                    })?
                    .to_vec();
                Ok(Some(FrontierEntry {
                    key,
                    run_slot: slot,
                    record,
                }))
            }
            Ok(None) => {
                if let Some(run) = self.runs[slot].take() {
                    log::debug!("run {} drained, closing", run.index());
                    run.close();
                }
                Ok(None)
            }
            Err(err) => Err(MergeError::RunRead {
                run_index,
                source: Box::new(err),
            }),
        }
    }

    /// Aborts the merge: closes every remaining run and fuses the iterator.
    fn fail(&mut self, err: MergeError) -> Option<Result<Record, MergeError>> {
        self.state = MergeState::Failed;
        self.frontier.clear();
        for slot in self.runs.iter_mut() {
            if let Some(run) = slot.take() {
                run.close();
            }
        }
        Some(Err(err))
    }
}

impl<R: Run> Iterator for RunMerger<R> {
    type Item = Result<Record, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            MergeState::Completed | MergeState::Failed => return None,
            MergeState::Initializing | MergeState::Merging => {}
        }

        if let Some(cancel) = &self.cancel {
            if cancel.load(AtomicOrdering::Relaxed) {
                return self.fail(MergeError::Cancelled);
            }
        }

        if self.state == MergeState::Initializing {
            for slot in 0..self.runs.len() {
                match self.pull(slot) {
                    Ok(Some(entry)) => self.frontier.push(Reverse(entry)),
                    Ok(None) => {}
                    Err(err) => return self.fail(err),
                }
            }
            self.state = MergeState::Merging;
            log::debug!("merge frontier seeded with {} runs", self.frontier.len());
        }

        let Reverse(entry) = match self.frontier.pop() {
            Some(entry) => entry,
            None => {
                self.state = MergeState::Completed;
                return None;
            }
        };

        match self.pull(entry.run_slot) {
            Ok(Some(next_entry)) => self.frontier.push(Reverse(next_entry)),
            Ok(None) => {}
            Err(err) => return self.fail(err),
        }

        Some(Ok(entry.record))
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::io;

    use rstest::*;

    use super::{MergeError, MergeState, RunMerger};
    use crate::record::Record;
    use crate::run::Run;

    /// In-memory run double; optionally fails after a number of reads.
    struct MemRun {
        index: usize,
        records: VecDeque<Record>,
        head: Option<Record>,
        fail_after: Option<usize>,
        reads: usize,
    }

    impl MemRun {
        fn sorted(index: usize, keys: &[&str]) -> Self {
            MemRun {
                index,
                records: keys.iter().map(|k| Record::new(vec![k.to_string()])).collect(),
                head: None,
                fail_after: None,
                reads: 0,
            }
        }

        fn failing(index: usize, keys: &[&str], fail_after: usize) -> Self {
            MemRun {
                fail_after: Some(fail_after),
                ..Self::sorted(index, keys)
            }
        }
    }

    impl Run for MemRun {
        type Error = io::Error;

        fn persist(
            _dir: &tempfile::TempDir,
            index: usize,
            records: Vec<Record>,
            _buf_size: Option<usize>,
        ) -> Result<Self, io::Error> {
            Ok(MemRun {
                index,
                records: records.into(),
                head: None,
                fail_after: None,
                reads: 0,
            })
        }

        fn index(&self) -> usize {
            self.index
        }

        fn peek(&mut self) -> Result<Option<&Record>, io::Error> {
            if self.head.is_none() {
                self.head = self.next_record()?;
            }
            Ok(self.head.as_ref())
        }

        fn next_record(&mut self) -> Result<Option<Record>, io::Error> {
            if let Some(head) = self.head.take() {
                return Ok(Some(head));
            }
            if let Some(fail_after) = self.fail_after {
                if self.reads >= fail_after {
                    return Err(io::Error::new(io::ErrorKind::Other, "torn run"));
                }
            }
            self.reads += 1;
            Ok(self.records.pop_front())
        }
    }

    fn keys(merger: RunMerger<MemRun>) -> Vec<String> {
        merger
            .map(|record| record.unwrap().fields()[0].clone())
            .collect()
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![vec![], vec![]], vec![])]
    #[case(
        vec![
            vec!["d", "e", "g"],
            vec!["a", "f"],
            vec!["c"],
            vec![],
        ],
        vec!["a", "c", "d", "e", "f", "g"],
    )]
    fn test_merge_order(#[case] runs: Vec<Vec<&str>>, #[case] expected: Vec<&str>) {
        let runs = Vec::from_iter(
            runs.iter()
                .enumerate()
                .map(|(idx, keys)| MemRun::sorted(idx, keys)),
        );
        assert_eq!(keys(RunMerger::new(runs, 0)), expected);
    }

    #[test]
    fn test_empty_merge_completes() {
        let mut merger = RunMerger::<MemRun>::new(vec![], 0);
        assert_eq!(merger.state(), MergeState::Initializing);
        assert!(merger.next().is_none());
        assert_eq!(merger.state(), MergeState::Completed);
    }

    #[test]
    fn test_duplicate_keys_resolve_by_run_number() {
        // three runs share the key "x"; the tag field tells them apart
        let runs = vec![
            MemRun {
                records: [vec!["x", "run0"], vec!["y", "run0"]]
                    .iter()
                    .map(|f| Record::new(f.iter().map(|s| s.to_string()).collect()))
                    .collect(),
                ..MemRun::sorted(0, &[])
            },
            MemRun {
                records: [vec!["x", "run1"]]
                    .iter()
                    .map(|f| Record::new(f.iter().map(|s| s.to_string()).collect()))
                    .collect(),
                ..MemRun::sorted(1, &[])
            },
            MemRun {
                records: [vec!["w", "run2"], vec!["x", "run2"]]
                    .iter()
                    .map(|f| Record::new(f.iter().map(|s| s.to_string()).collect()))
                    .collect(),
                ..MemRun::sorted(2, &[])
            },
        ];

        let tags: Vec<(String, String)> = RunMerger::new(runs, 0)
            .map(|record| {
                let record = record.unwrap();
                (record.fields()[0].clone(), record.fields()[1].clone())
            })
            .collect();

        assert_eq!(
            tags,
            vec![
                ("w".to_string(), "run2".to_string()),
                ("x".to_string(), "run0".to_string()),
                ("x".to_string(), "run1".to_string()),
                ("x".to_string(), "run2".to_string()),
                ("y".to_string(), "run0".to_string()),
            ]
        );
    }

    #[test]
    fn test_unordered_runs_still_tie_break_by_run_number() {
        let tagged_run = |index: usize, tag: &str| MemRun {
            records: [Record::new(vec!["x".to_string(), tag.to_string()])].into(),
            ..MemRun::sorted(index, &[])
        };

        // runs supplied out of run-number order; the duplicate key must
        // still resolve to the lowest-numbered run first
        let merger = RunMerger::new(vec![tagged_run(1, "run1"), tagged_run(0, "run0")], 0);
        let tags: Vec<String> = merger
            .map(|record| record.unwrap().fields()[1].clone())
            .collect();

        assert_eq!(tags, vec!["run0", "run1"]);
    }

    #[test]
    fn test_cancellation_between_merge_steps() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let cancel = Arc::new(AtomicBool::new(false));
        let runs = vec![MemRun::sorted(0, &["a", "b", "c"])];
        let mut merger = RunMerger::with_cancel(runs, 0, Some(Arc::clone(&cancel)));

        assert_eq!(merger.next().unwrap().unwrap().fields(), &["a"]);
        cancel.store(true, Ordering::Relaxed);

        let err = merger.next().unwrap().unwrap_err();
        assert!(matches!(err, MergeError::Cancelled));
        assert_eq!(merger.state(), MergeState::Failed);
        assert!(merger.next().is_none());
    }

    #[test]
    fn test_run_error_aborts_and_fuses() {
        let runs = vec![
            MemRun::sorted(0, &["a", "b"]),
            MemRun::failing(1, &["c", "d"], 1),
        ];
        let mut merger = RunMerger::new(runs, 0);

        assert_eq!(merger.next().unwrap().unwrap().fields(), &["a"]);
        assert_eq!(merger.next().unwrap().unwrap().fields(), &["b"]);
        let err = merger.next().unwrap().unwrap_err();
        assert!(matches!(err, MergeError::RunRead { run_index: 1, .. }));
        assert_eq!(merger.state(), MergeState::Failed);
        assert!(merger.next().is_none());
    }

    #[test]
    fn test_missing_key_column_aborts() {
        let runs = vec![MemRun {
            records: [Record::new(vec!["only-one-field".to_string()])].into(),
            ..MemRun::sorted(0, &[])
        }];
        let mut merger = RunMerger::new(runs, 1);

        let err = merger.next().unwrap().unwrap_err();
        assert!(matches!(err, MergeError::MissingKey { run_index: 0, column: 1 }));
        assert!(merger.next().is_none());
    }
}
