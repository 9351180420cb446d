//! File slots
//!
//! A slot owns one physical file of the rotation set. `first_bsn` locates
//! the block that starts the file's current cycle, so a block's byte offset
//! is `(bsn - first_bsn) * block_capacity`. `high_mark` is the key of the
//! first record written to the next slot in rotation; reusing this slot is
//! legal only once the engine's active mark has reached it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{LogError, LogResult};
use crate::key::LogKey;

pub(crate) struct FileSlot {
    index: usize,
    path: PathBuf,
    file: File,
    block_capacity: usize,
    /// First BSN of the current cycle; 0 while the slot holds no data.
    first_bsn: u64,
    /// Blocks of the current cycle confirmed written.
    blocks_written: u64,
    /// Cumulative bytes written across all cycles.
    bytes_written: u64,
    /// Times this slot has been rewound for reuse.
    rewind_count: u64,
    /// Key of the first record in the next slot; ZERO until rotation has
    /// moved past this slot once.
    high_mark: LogKey,
}

impl FileSlot {
    /// Open or create the slot's file with read/write access.
    pub(crate) fn open(index: usize, path: &Path, block_capacity: usize) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                LogError::Io(format!("failed to open log file {}: {}", path.display(), e))
            })?;
        Ok(Self {
            index,
            path: path.to_path_buf(),
            file,
            block_capacity,
            first_bsn: 0,
            blocks_written: 0,
            bytes_written: 0,
            rewind_count: 0,
            high_mark: LogKey::ZERO,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn first_bsn(&self) -> u64 {
        self.first_bsn
    }

    pub(crate) fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    pub(crate) fn rewind_count(&self) -> u64 {
        self.rewind_count
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn high_mark(&self) -> LogKey {
        self.high_mark
    }

    pub(crate) fn set_high_mark(&mut self, key: LogKey) {
        self.high_mark = key;
    }

    /// Whether the slot's current cycle contains the given block.
    pub(crate) fn contains(&self, bsn: u64) -> bool {
        self.first_bsn != 0 && bsn >= self.first_bsn && bsn < self.first_bsn + self.blocks_written
    }

    /// Begin a new cycle at the given first BSN. The next physical write
    /// lands at position zero.
    pub(crate) fn begin_cycle(&mut self, first_bsn: u64) {
        if self.first_bsn != 0 {
            self.rewind_count += 1;
        }
        self.first_bsn = first_bsn;
        self.blocks_written = 0;
    }

    /// Adopt on-disk state discovered during the restart scan.
    pub(crate) fn recover(&mut self, first_bsn: u64, blocks_written: u64) {
        self.first_bsn = first_bsn;
        self.blocks_written = blocks_written;
        self.bytes_written = blocks_written * self.block_capacity as u64;
    }

    /// Write one block image at its position for the current cycle.
    pub(crate) fn write_block(&mut self, bsn: u64, buf: &[u8]) -> LogResult<()> {
        debug_assert!(self.first_bsn != 0 && bsn >= self.first_bsn);
        debug_assert_eq!(buf.len(), self.block_capacity);
        let position = (bsn - self.first_bsn) * self.block_capacity as u64;
        self.file.seek(SeekFrom::Start(position)).map_err(|e| {
            LogError::Io(format!(
                "seek to block {} in {} failed: {}",
                bsn,
                self.path.display(),
                e
            ))
        })?;
        self.file.write_all(buf).map_err(|e| {
            LogError::Io(format!(
                "write of block {} to {} failed: {}",
                bsn,
                self.path.display(),
                e
            ))
        })?;
        self.blocks_written = self.blocks_written.max(bsn - self.first_bsn + 1);
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Read the block image at a cycle-relative index. Returns false when
    /// the file ends before a full block.
    pub(crate) fn read_block_at(&mut self, block_index: u64, buf: &mut [u8]) -> LogResult<bool> {
        debug_assert_eq!(buf.len(), self.block_capacity);
        let position = block_index * self.block_capacity as u64;
        self.file.seek(SeekFrom::Start(position))?;
        match read_full(&mut self.file, buf) {
            Ok(true) => Ok(true),
            Ok(false) => Ok(false),
            Err(e) => Err(LogError::Io(format!(
                "read of block index {} from {} failed: {}",
                block_index,
                self.path.display(),
                e
            ))),
        }
    }

    /// Read the block image for a BSN of the current cycle.
    pub(crate) fn read_block(&mut self, bsn: u64, buf: &mut [u8]) -> LogResult<bool> {
        debug_assert!(self.contains(bsn));
        self.read_block_at(bsn - self.first_bsn, buf)
    }

    /// Force file contents to stable storage.
    pub(crate) fn sync(&self) -> LogResult<()> {
        self.file.sync_all().map_err(|e| {
            LogError::Io(format!(
                "fsync of log file {} ({}) failed: {}",
                self.index,
                self.path.display(),
                e
            ))
        })
    }
}

/// Read exactly `buf.len()` bytes; false on clean EOF before any byte or a
/// short tail.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CAP: usize = 256;

    fn slot_in(dir: &TempDir) -> FileSlot {
        FileSlot::open(0, &dir.path().join("slot_0.howl"), CAP).unwrap()
    }

    #[test]
    fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let slot = slot_in(&dir);
        assert!(slot.path().exists());
        assert_eq!(slot.first_bsn(), 0);
        assert_eq!(slot.rewind_count(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut slot = slot_in(&dir);
        slot.begin_cycle(5);

        let image = vec![0x5Au8; CAP];
        slot.write_block(5, &image).unwrap();
        slot.write_block(6, &image).unwrap();
        assert_eq!(slot.blocks_written(), 2);
        assert!(slot.contains(5));
        assert!(slot.contains(6));
        assert!(!slot.contains(7));

        let mut back = vec![0u8; CAP];
        assert!(slot.read_block(6, &mut back).unwrap());
        assert_eq!(back, image);
    }

    #[test]
    fn test_read_past_end_is_clean() {
        let dir = TempDir::new().unwrap();
        let mut slot = slot_in(&dir);
        let mut buf = vec![0u8; CAP];
        assert!(!slot.read_block_at(0, &mut buf).unwrap());
    }

    #[test]
    fn test_rewind_counts_reuse() {
        let dir = TempDir::new().unwrap();
        let mut slot = slot_in(&dir);
        slot.begin_cycle(1);
        assert_eq!(slot.rewind_count(), 0);
        slot.begin_cycle(9);
        assert_eq!(slot.rewind_count(), 1);
        assert_eq!(slot.first_bsn(), 9);
        assert_eq!(slot.blocks_written(), 0);
    }

    #[test]
    fn test_rewound_write_lands_at_position_zero() {
        let dir = TempDir::new().unwrap();
        let mut slot = slot_in(&dir);
        slot.begin_cycle(1);
        slot.write_block(1, &vec![0x11u8; CAP]).unwrap();
        slot.write_block(2, &vec![0x22u8; CAP]).unwrap();

        slot.begin_cycle(9);
        slot.write_block(9, &vec![0x99u8; CAP]).unwrap();

        let mut back = vec![0u8; CAP];
        assert!(slot.read_block_at(0, &mut back).unwrap());
        assert_eq!(back, vec![0x99u8; CAP]);
    }
}
