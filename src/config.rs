//! Engine configuration.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Memory ceiling for a single block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryLimit {
    /// Absolute byte ceiling.
    Bytes(u64),
    /// Fraction of available memory, in `(0, 1]`.
    Fraction(f64),
}

/// Configuration validation error.
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// Available memory is zero.
    NoMemoryAvailable,
    /// Budget fraction is outside `(0, 1]`.
    InvalidFraction(f64),
    /// The computed block budget is not positive.
    ZeroBudget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoMemoryAvailable => write!(f, "available memory must be positive"),
            ConfigError::InvalidFraction(fraction) => {
                write!(f, "memory fraction must be in (0, 1], got {}", fraction)
            }
            ConfigError::ZeroBudget => write!(f, "computed block budget is zero"),
        }
    }
}

impl Error for ConfigError {}

/// External sort configuration. Passed explicitly into the engine;
/// independent sorts with different settings may run side by side.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Index of the column records are sorted by.
    pub key_column: usize,
    /// Per-block memory ceiling.
    pub memory_limit: MemoryLimit,
    /// Memory considered available to the whole engine run. Also bounds
    /// the number of blocks in flight at `memory_available / budget`.
    pub memory_available: u64,
    /// Number of worker threads. Defaults to the CPU core count.
    pub threads: Option<usize>,
    /// Directory for run storage. Defaults to the OS temporary directory.
    pub tmp_dir: Option<PathBuf>,
    /// Run file read/write buffer size.
    pub rw_buf_size: Option<usize>,
}

impl SortConfig {
    pub fn new(key_column: usize, memory_limit: MemoryLimit, memory_available: u64) -> Self {
        SortConfig {
            key_column,
            memory_limit,
            memory_available,
            threads: None,
            tmp_dir: None,
            rw_buf_size: None,
        }
    }

    /// Computes the per-block byte budget. Computed once per engine run
    /// and held constant afterwards.
    pub fn block_budget(&self) -> Result<u64, ConfigError> {
        if self.memory_available == 0 {
            return Err(ConfigError::NoMemoryAvailable);
        }

        let budget = match self.memory_limit {
            MemoryLimit::Bytes(bytes) => bytes.min(self.memory_available),
            MemoryLimit::Fraction(fraction) => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(ConfigError::InvalidFraction(fraction));
                }
                (self.memory_available as f64 * fraction) as u64
            }
        };

        if budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        Ok(budget)
    }

    /// Upper bound on concurrently in-flight blocks: the number of budget
    /// sized blocks that fit into available memory, at least one.
    pub fn max_inflight_blocks(&self) -> Result<usize, ConfigError> {
        let budget = self.block_budget()?;
        Ok((self.memory_available / budget).max(1) as usize)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{ConfigError, MemoryLimit, SortConfig};

    #[rstest]
    #[case(MemoryLimit::Bytes(1000), 4000, Ok(1000))]
    #[case(MemoryLimit::Bytes(8000), 4000, Ok(4000))]
    #[case(MemoryLimit::Fraction(0.5), 4000, Ok(2000))]
    #[case(MemoryLimit::Bytes(0), 4000, Err(ConfigError::ZeroBudget))]
    #[case(MemoryLimit::Bytes(1000), 0, Err(ConfigError::NoMemoryAvailable))]
    #[case(MemoryLimit::Fraction(0.0), 4000, Err(ConfigError::InvalidFraction(0.0)))]
    #[case(MemoryLimit::Fraction(1.5), 4000, Err(ConfigError::InvalidFraction(1.5)))]
    fn test_block_budget(
        #[case] limit: MemoryLimit,
        #[case] available: u64,
        #[case] expected: Result<u64, ConfigError>,
    ) {
        let config = SortConfig::new(0, limit, available);
        assert_eq!(config.block_budget(), expected);
    }

    #[test]
    fn test_max_inflight_blocks() {
        let config = SortConfig::new(0, MemoryLimit::Bytes(1000), 4000);
        assert_eq!(config.max_inflight_blocks().unwrap(), 4);

        // the budget saturates at available memory, leaving room for one block
        let config = SortConfig::new(0, MemoryLimit::Bytes(8000), 4000);
        assert_eq!(config.max_inflight_blocks().unwrap(), 1);
    }
}
