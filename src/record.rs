//! Record framing and control record payloads
//!
//! Every record in a block is framed as `type (u16) | length (u16) |
//! payload`, big-endian. Data records carry caller bytes; control records
//! carry engine state so a reader can reposition after a crash without any
//! external metadata. Records never span blocks.

use crate::errors::{LogError, LogResult};
use crate::key::LogKey;

/// Bytes of framing around each record payload: type and length.
pub const FRAME_SIZE: usize = 4;

/// Largest payload the 16-bit length field can express.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Bit distinguishing engine control records from caller data.
const CTRL_FLAG: u16 = 0x4000;

/// Record types as persisted in the frame's type field.
///
/// `EndOfLog` is a pseudo-record: it is delivered to replay sinks to signal
/// the end of the written log and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    /// Caller data.
    Data = 0x0001,
    /// First record of each file: restart state snapshot.
    FileHeader = CTRL_FLAG | 0x0001,
    /// The active mark was advanced to the contained key.
    Mark = CTRL_FLAG | 0x0002,
    /// Automatic marking was toggled.
    AutoMark = CTRL_FLAG | 0x0003,
    /// End of written log; replay-only, never on disk.
    EndOfLog = CTRL_FLAG | 0x0FFF,
}

impl RecordType {
    /// Convert from the persisted field, `None` for unknown values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            v if v == RecordType::Data as u16 => Some(RecordType::Data),
            v if v == RecordType::FileHeader as u16 => Some(RecordType::FileHeader),
            v if v == RecordType::Mark as u16 => Some(RecordType::Mark),
            v if v == RecordType::AutoMark as u16 => Some(RecordType::AutoMark),
            v if v == RecordType::EndOfLog as u16 => Some(RecordType::EndOfLog),
            _ => None,
        }
    }

    /// Convert to the persisted field.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this is an engine control record.
    pub fn is_control(self) -> bool {
        self.as_u16() & CTRL_FLAG != 0
    }
}

/// Payload of the `FileHeader` control record written as the first record of
/// every file: enough state for a reader to reposition after a crash.
///
/// Layout: `auto_mark (1) | active_mark (8) | prev_high_mark (8) |
/// prev_switch_time_ms (8)`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeaderPayload {
    /// Automatic marking state at the time of the switch.
    pub auto_mark: bool,
    /// Active mark at the time of the switch.
    pub active_mark: LogKey,
    /// High mark of the previous file in rotation.
    pub prev_high_mark: LogKey,
    /// Wall-clock time of the previous file switch, epoch milliseconds.
    pub prev_switch_time_ms: i64,
}

/// Serialized size of a `FileHeaderPayload`.
pub const FILE_HEADER_PAYLOAD_SIZE: usize = 1 + 8 + 8 + 8;

impl FileHeaderPayload {
    /// Serialize to the persisted layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FILE_HEADER_PAYLOAD_SIZE);
        buf.push(self.auto_mark as u8);
        buf.extend_from_slice(&self.active_mark.as_u64().to_be_bytes());
        buf.extend_from_slice(&self.prev_high_mark.as_u64().to_be_bytes());
        buf.extend_from_slice(&self.prev_switch_time_ms.to_be_bytes());
        buf
    }

    /// Deserialize from the persisted layout.
    pub fn deserialize(data: &[u8]) -> LogResult<Self> {
        if data.len() < FILE_HEADER_PAYLOAD_SIZE {
            return Err(LogError::InvalidLogBuffer(format!(
                "file header record too short: {} bytes",
                data.len()
            )));
        }
        let u64_at = |start: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[start..start + 8]);
            u64::from_be_bytes(bytes)
        };
        Ok(Self {
            auto_mark: data[0] != 0,
            active_mark: LogKey::from_u64(u64_at(1)),
            prev_high_mark: LogKey::from_u64(u64_at(9)),
            prev_switch_time_ms: u64_at(17) as i64,
        })
    }
}

/// Payload of the `Mark` control record: the key the mark advanced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkPayload {
    pub mark: LogKey,
}

impl MarkPayload {
    pub fn serialize(&self) -> Vec<u8> {
        self.mark.as_u64().to_be_bytes().to_vec()
    }

    pub fn deserialize(data: &[u8]) -> LogResult<Self> {
        if data.len() < 8 {
            return Err(LogError::InvalidLogBuffer(format!(
                "mark record too short: {} bytes",
                data.len()
            )));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[0..8]);
        Ok(Self {
            mark: LogKey::from_u64(u64::from_be_bytes(bytes)),
        })
    }
}

/// Payload of the `AutoMark` control record: the new toggle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoMarkPayload {
    pub enabled: bool,
}

impl AutoMarkPayload {
    pub fn serialize(&self) -> Vec<u8> {
        vec![self.enabled as u8]
    }

    pub fn deserialize(data: &[u8]) -> LogResult<Self> {
        if data.is_empty() {
            return Err(LogError::InvalidLogBuffer(
                "automark record is empty".to_string(),
            ));
        }
        Ok(Self {
            enabled: data[0] != 0,
        })
    }
}
