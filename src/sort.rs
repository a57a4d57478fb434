//! External sort engine.

use std::error::Error;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use log;

use crate::block::{Block, MissingKeyError};
use crate::config::{ConfigError, SortConfig};
use crate::merge::RunMerger;
use crate::partition::Partitioner;
use crate::record::Record;
use crate::run::{RmpRun, Run};

/// Sorting error. Every variant is fatal to the whole operation: external
/// sort gives an all-or-nothing completeness guarantee, so no partial
/// result is ever returned.
#[derive(Debug)]
pub enum SortError<E: Error> {
    /// Invalid configuration.
    Config(ConfigError),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPool(rayon::ThreadPoolBuildError),
    /// Input source read failure.
    Read(E),
    /// A single record's encoded size reached the block budget. A block
    /// cannot be split below record granularity, so the whole sort aborts.
    OversizedRecord {
        block_index: usize,
        record_size: u64,
        budget: u64,
    },
    /// A record lacking the key column.
    MissingKey(MissingKeyError),
    /// Run persistence failure.
    Write {
        run_index: usize,
        source: Box<dyn Error + Send + Sync>,
    },
    /// The operation was cancelled between block boundaries.
    Cancelled,
}

impl<E: Error + 'static> Error for SortError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::Config(err) => Some(err),
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPool(err) => Some(err),
            SortError::Read(err) => Some(err),
            SortError::MissingKey(err) => Some(err),
            SortError::Write { source, .. } => Some(source.as_ref()),
            SortError::OversizedRecord { .. } | SortError::Cancelled => None,
        }
    }
}

impl<E: Error> fmt::Display for SortError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::Config(err) => write!(f, "invalid configuration: {}", err),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPool(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Read(err) => write!(f, "input data stream error: {}", err),
            SortError::OversizedRecord {
                block_index,
                record_size,
                budget,
            } => write!(
                f,
                "record of {} bytes in block {} reaches the block budget of {} bytes",
                record_size, block_index, budget
            ),
            SortError::MissingKey(err) => write!(f, "malformed record: {}", err),
            SortError::Write { run_index, source } => {
                write!(f, "writing run {} failed: {}", run_index, source)
            }
            SortError::Cancelled => write!(f, "sort cancelled"),
        }
    }
}

impl<E: Error> From<ConfigError> for SortError<E> {
    fn from(err: ConfigError) -> Self {
        SortError::Config(err)
    }
}

/// Failure of one block's sort-and-persist unit. Workers report these over
/// the result channel; the driver folds them into [`SortError`].
#[derive(Debug)]
enum BlockError {
    MissingKey(MissingKeyError),
    Write {
        run_index: usize,
        source: Box<dyn Error + Send + Sync>,
    },
}

impl<E: Error> From<BlockError> for SortError<E> {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::MissingKey(err) => SortError::MissingKey(err),
            BlockError::Write { run_index, source } => SortError::Write { run_index, source },
        }
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`]
/// initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<E, R = RmpRun>
where
    E: Error,
    R: Run,
{
    config: SortConfig,

    /// Run type.
    run_type: PhantomData<R>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<E, R> ExternalSorterBuilder<E, R>
where
    E: Error,
    R: Run,
{
    /// Creates a builder from the mandatory configuration.
    pub fn new(config: SortConfig) -> Self {
        ExternalSorterBuilder {
            config,
            run_type: PhantomData,
            input_error_type: PhantomData,
        }
    }

    /// Builds an [`ExternalSorter`] instance using the provided configuration.
    pub fn build(self) -> Result<ExternalSorter<E, R>, SortError<E>> {
        ExternalSorter::new(self.config)
    }

    /// Sets the number of threads used to sort and persist blocks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> Self {
        self.config.threads = Some(threads_number);
        self
    }

    /// Sets the directory used to store run data.
    pub fn with_tmp_dir(mut self, path: &Path) -> Self {
        self.config.tmp_dir = Some(path.to_path_buf());
        self
    }

    /// Sets the run file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.config.rw_buf_size = Some(buf_size);
        self
    }
}

/// External sorter. Partitions a record stream into budget-bounded blocks,
/// sorts and persists them as runs on a bounded worker pool and returns a
/// [`RunMerger`] over the resulting runs.
pub struct ExternalSorter<E, R = RmpRun>
where
    E: Error,
    R: Run,
{
    config: SortConfig,
    /// Block sort-and-persist worker pool.
    thread_pool: rayon::ThreadPool,
    /// Directory holding run storage; removed when the sorter is dropped.
    tmp_dir: tempfile::TempDir,
    /// Cooperative cancellation flag, checked between block boundaries and
    /// between merge steps.
    cancel: Arc<AtomicBool>,

    /// Run type.
    run_type: PhantomData<R>,
    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<E, R> ExternalSorter<E, R>
where
    E: Error,
    R: Run,
{
    /// Creates a new external sorter instance. The configuration is
    /// validated up front: a non-positive computed budget is rejected here.
    pub fn new(config: SortConfig) -> Result<Self, SortError<E>> {
        config.block_budget()?;

        Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(config.threads)?,
            tmp_dir: Self::init_tmp_directory(config.tmp_dir.as_deref())?,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            run_type: PhantomData,
            input_error_type: PhantomData,
        })
    }

    /// Returns a handle that cancels the pipeline when set. Cancellation is
    /// cooperative: it takes effect at the next block or merge boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError<E>> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }

        thread_pool_builder.build().map_err(SortError::ThreadPool)
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError<E>> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a run directory", tmp_dir.path().display());

        Ok(tmp_dir)
    }

    /// Sorts records from the input stream.
    ///
    /// Partitions the source into blocks, sorts and persists each block as a
    /// run on the worker pool (at most `memory_available / budget` blocks in
    /// flight) and returns a merger yielding the globally ordered stream.
    ///
    /// # Arguments
    /// * `input` - Record stream to be sorted
    pub fn sort<I>(&self, input: I) -> Result<RunMerger<R>, SortError<E>>
    where
        I: IntoIterator<Item = Result<Record, E>>,
    {
        let budget = self.config.block_budget()?;
        let max_inflight = self.config.max_inflight_blocks()?;
        log::info!(
            "block budget: {} bytes, in-flight block cap: {}",
            budget,
            max_inflight
        );

        let mut partitioner = Partitioner::new(input.into_iter(), budget);
        let mut runs: Vec<R> = Vec::new();
        let mut failure: Option<SortError<E>> = None;

        self.thread_pool.in_place_scope(|scope| {
            let (result_tx, result_rx) = mpsc::channel::<Result<R, BlockError>>();
            let mut in_flight = 0usize;

            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    failure = Some(SortError::Cancelled);
                    break;
                }

                let block = match partitioner.next_block() {
                    Ok(Some(block)) => block,
                    Ok(None) => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                };

                // another in-flight block would exceed the memory budget,
                // so collect a finished run first
                if in_flight == max_inflight {
                    match result_rx.recv() {
                        Ok(Ok(run)) => {
                            in_flight -= 1;
                            runs.push(run);
                        }
                        Ok(Err(err)) => {
                            failure = Some(err.into());
                            break;
                        }
                        Err(_) => break,
                    }
                }

                in_flight += 1;
                let tx = result_tx.clone();
                let key_column = self.config.key_column;
                let rw_buf_size = self.config.rw_buf_size;
                let tmp_dir = &self.tmp_dir;
                scope.spawn(move |_| {
                    let result = Self::sort_and_persist(block, key_column, tmp_dir, rw_buf_size);
                    // send fails only once the driver has already bailed out
                    let _ = tx.send(result);
                });
            }

            drop(result_tx);
            for result in result_rx {
                match result {
                    Ok(run) => runs.push(run),
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(err.into());
                        }
                    }
                }
            }
        });

        if let Some(err) = failure {
            return Err(err);
        }

        // workers finish out of order; the merger arranges the collected
        // runs back into source order by run number
        log::debug!("{} runs written, external sort preparation done", runs.len());

        Ok(RunMerger::with_cancel(
            runs,
            self.config.key_column,
            Some(Arc::clone(&self.cancel)),
        ))
    }

    /// One block's sort-and-persist unit, executed on the worker pool.
    fn sort_and_persist(
        mut block: Block,
        key_column: usize,
        tmp_dir: &tempfile::TempDir,
        rw_buf_size: Option<usize>,
    ) -> Result<R, BlockError> {
        log::debug!("sorting block {} ...", block.index());
        block
            .sort_by_column(key_column)
            .map_err(BlockError::MissingKey)?;

        log::debug!("writing run {}", block.index());
        let run_index = block.index();
        R::persist(tmp_dir, run_index, block.into_records(), rw_buf_size).map_err(|err| {
            BlockError::Write {
                run_index,
                source: Box::new(err),
            }
        })
    }
}
