//! Binary capture-log writer.
//!
//! Layout: an 8-byte magic, then a stream of records. Schemas must be
//! registered before the first message on their channel. While open the
//! file carries a `.part<ns>` infix; `close` renames it to its final name
//! so crashed runs are recognizable on disk.
//!
//! ```text
//! magic  "DBCAP\x01\0\0"
//! record u8 tag
//!   1 = schema : u16 channel_id, str16 name, str16 topic, str32 schema_json
//!   2 = message: u16 channel_id, u32 sequence, u64 log_time,
//!                u64 publish_time, str32 data
//! ```
//! (`strN` = N-bit little-endian length followed by raw bytes.)

use crate::{CaptureError, CaptureResult};
use databeam_core::TimeSource;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAGIC: &[u8; 8] = b"DBCAP\x01\0\0";
pub const REC_SCHEMA: u8 = 1;
pub const REC_MESSAGE: u8 = 2;

/// One captured record, borrowed from the broker's serialization buffer.
#[derive(Debug, Clone, Copy)]
pub struct CaptureMessage<'a> {
    pub channel_id: u16,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: &'a [u8],
}

pub struct CaptureWriter {
    file: Option<BufWriter<File>>,
    part_path: PathBuf,
    final_path: PathBuf,
    next_channel_id: u16,
}

impl CaptureWriter {
    /// Create the partial file next to the final path.
    pub fn create(final_path: &Path) -> CaptureResult<Self> {
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part_path =
            final_path.with_file_name(format!("{file_name}.part{}", TimeSource::now_ns()));

        let mut file = BufWriter::new(File::create(&part_path)?);
        file.write_all(MAGIC)?;
        debug!(path = %part_path.display(), "capture file opened");

        Ok(Self {
            file: Some(file),
            part_path,
            final_path: final_path.to_path_buf(),
            next_channel_id: 0,
        })
    }

    /// Register a schema and its channel; returns the channel id used by
    /// subsequent messages.
    pub fn add_schema(&mut self, name: &str, topic: &str, schema_json: &str) -> CaptureResult<u16> {
        let file = self.file.as_mut().ok_or(CaptureError::Closed)?;
        let id = self.next_channel_id;
        self.next_channel_id += 1;

        file.write_all(&[REC_SCHEMA])?;
        file.write_all(&id.to_le_bytes())?;
        write_str16(file, name)?;
        write_str16(file, topic)?;
        write_bytes32(file, schema_json.as_bytes())?;
        Ok(id)
    }

    pub fn write_message(&mut self, msg: &CaptureMessage<'_>) -> CaptureResult<()> {
        let file = self.file.as_mut().ok_or(CaptureError::Closed)?;
        if msg.channel_id >= self.next_channel_id {
            return Err(CaptureError::UnknownChannel(msg.channel_id));
        }
        file.write_all(&[REC_MESSAGE])?;
        file.write_all(&msg.channel_id.to_le_bytes())?;
        file.write_all(&msg.sequence.to_le_bytes())?;
        file.write_all(&msg.log_time.to_le_bytes())?;
        file.write_all(&msg.publish_time.to_le_bytes())?;
        write_bytes32(file, msg.data)?;
        Ok(())
    }

    /// Flush, close and move the partial file to its final name. If a
    /// finished file already exists (crash and relaunch), the partial name
    /// is kept.
    pub fn close(mut self) -> CaptureResult<PathBuf> {
        let file = self.file.take().ok_or(CaptureError::Closed)?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        if self.final_path.exists() {
            warn!(path = %self.final_path.display(), "finished capture file already exists, keeping partial name");
            return Ok(self.part_path.clone());
        }
        std::fs::rename(&self.part_path, &self.final_path)?;
        debug!(path = %self.final_path.display(), "capture file closed");
        Ok(self.final_path.clone())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        // A dropped writer leaves the .part file behind on purpose: the
        // measurement did not finish cleanly.
        if self.file.is_some() {
            warn!(path = %self.part_path.display(), "capture writer dropped without close");
        }
    }
}

fn write_str16<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    let bytes = s.as_bytes();
    w.write_all(&(bytes.len() as u16).to_le_bytes())?;
    w.write_all(bytes)
}

fn write_bytes32<W: Write>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_renames_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("imu.mcap");

        let mut writer = CaptureWriter::create(&final_path).unwrap();
        let ch = writer.add_schema("imu_0", "imu", "{}").unwrap();
        writer
            .write_message(&CaptureMessage {
                channel_id: ch,
                sequence: 0,
                log_time: 1,
                publish_time: 1,
                data: b"{\"x\":1}",
            })
            .unwrap();
        let path = writer.close().unwrap();

        assert_eq!(path, final_path);
        assert!(final_path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn existing_final_file_keeps_partial_name() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("imu.mcap");
        std::fs::write(&final_path, b"old").unwrap();

        let writer = CaptureWriter::create(&final_path).unwrap();
        let kept = writer.close().unwrap();
        assert_ne!(kept, final_path);
        assert!(kept.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"old");
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CaptureWriter::create(&dir.path().join("x.mcap")).unwrap();
        let err = writer
            .write_message(&CaptureMessage {
                channel_id: 3,
                sequence: 0,
                log_time: 0,
                publish_time: 0,
                data: b"{}",
            })
            .unwrap_err();
        assert!(matches!(err, CaptureError::UnknownChannel(3)));
    }
}
