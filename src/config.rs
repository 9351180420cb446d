//! Log engine configuration
//!
//! All fields have defaults so a config can be built from a partial JSON
//! document. `validate` is called by `Log::open` before any file is touched.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::block;
use crate::errors::{LogError, LogResult};
use crate::key;

/// Smallest accepted block size: header, footer, a file header record and
/// room for at least a small payload.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Largest accepted block size: record offsets must fit the 24-bit offset
/// field of a [`crate::LogKey`].
pub const MAX_BLOCK_SIZE: usize = 1 << key::OFFSET_BITS;

/// Configuration for a [`crate::Log`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the log file set.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Base name of the log files; file `n` is `<file_name>_<n>.howl`.
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Block size in bytes. Also the unit of physical writes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of block buffers allocated at open.
    #[serde(default = "default_min_buffers")]
    pub min_buffers: usize,

    /// Upper bound the pool may grow to under sustained load.
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,

    /// Number of physical files in the rotation set.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Blocks written to a file before rotating to the next one.
    #[serde(default = "default_max_blocks_per_file")]
    pub max_blocks_per_file: u64,

    /// Interval of the background flush task, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Number of threads waiting for durability above which a force always
    /// flushes instead of deferring.
    #[serde(default = "default_waiting_threads_threshold")]
    pub waiting_threads_threshold: usize,

    /// Whether block headers carry a CRC32 over the record region.
    #[serde(default = "default_checksum_enabled")]
    pub checksum_enabled: bool,

    /// Whether every successful sync append implicitly advances the mark.
    #[serde(default)]
    pub auto_mark: bool,
}

fn default_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_file_name() -> String {
    "howl".to_string()
}

fn default_buffer_size() -> usize {
    4096
}

fn default_min_buffers() -> usize {
    4
}

fn default_max_buffers() -> usize {
    16
}

fn default_max_files() -> usize {
    2
}

fn default_max_blocks_per_file() -> u64 {
    128
}

fn default_flush_interval_ms() -> u64 {
    50
}

fn default_waiting_threads_threshold() -> usize {
    8
}

fn default_checksum_enabled() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            file_name: default_file_name(),
            buffer_size: default_buffer_size(),
            min_buffers: default_min_buffers(),
            max_buffers: default_max_buffers(),
            max_files: default_max_files(),
            max_blocks_per_file: default_max_blocks_per_file(),
            flush_interval_ms: default_flush_interval_ms(),
            waiting_threads_threshold: default_waiting_threads_threshold(),
            checksum_enabled: default_checksum_enabled(),
            auto_mark: false,
        }
    }
}

impl LogConfig {
    /// Create a config rooted at the given directory, defaults elsewhere.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> LogResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: LogConfig = serde_json::from_str(&text)
            .map_err(|e| LogError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> LogResult<()> {
        if self.buffer_size < MIN_BLOCK_SIZE || self.buffer_size > MAX_BLOCK_SIZE {
            return Err(LogError::Config(format!(
                "buffer_size {} outside [{}, {}]",
                self.buffer_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.min_buffers < 2 {
            return Err(LogError::Config(
                "min_buffers must be at least 2".to_string(),
            ));
        }
        if self.max_buffers < self.min_buffers {
            return Err(LogError::Config(format!(
                "max_buffers {} below min_buffers {}",
                self.max_buffers, self.min_buffers
            )));
        }
        if self.max_files < 2 {
            return Err(LogError::Config("max_files must be at least 2".to_string()));
        }
        // With one block per file every block would start with a file header
        // record, and a maximum-size record could never be framed.
        if self.max_blocks_per_file < 2 {
            return Err(LogError::Config(
                "max_blocks_per_file must be at least 2".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(LogError::Config(
                "flush_interval_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of file `index` in the rotation set.
    pub fn file_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{}_{}.howl", self.file_name, index))
    }

    /// Bytes of one block available to records, including their framing.
    pub fn usable_block_capacity(&self) -> usize {
        self.buffer_size - block::HEADER_SIZE - block::FOOTER_SIZE
    }

    /// Largest payload a single record can carry.
    pub fn max_record_payload(&self) -> usize {
        (self.usable_block_capacity() - crate::record::FRAME_SIZE)
            .min(crate::record::MAX_PAYLOAD)
    }
}
