//! Offline capture-log reader.
//!
//! Two layers: raw record iteration ([`CaptureReader`]) and columnar decode
//! ([`read_into`]) that converts JSON message bodies into a caller-described
//! flat row layout, the shape downstream numeric tooling expects.

use crate::writer::{MAGIC, REC_MESSAGE, REC_SCHEMA};
use crate::{CaptureError, CaptureResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Channel metadata collected from schema records.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub topic: String,
    pub schema_json: String,
}

/// One decoded message record.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub channel_id: u16,
    pub topic: String,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Vec<u8>,
}

pub struct CaptureReader {
    file: BufReader<File>,
    channels: HashMap<u16, ChannelInfo>,
}

impl CaptureReader {
    pub fn open(path: &Path) -> CaptureResult<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CaptureError::BadMagic(path.display().to_string()));
        }
        Ok(Self {
            file,
            channels: HashMap::new(),
        })
    }

    /// Channels seen so far; grows while iterating.
    pub fn channels(&self) -> &HashMap<u16, ChannelInfo> {
        &self.channels
    }

    /// Next message record in log order, consuming schema records along the
    /// way. `None` at end of file.
    pub fn next_message(&mut self) -> CaptureResult<Option<RawMessage>> {
        loop {
            let mut tag = [0u8; 1];
            match self.file.read_exact(&mut tag) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            match tag[0] {
                REC_SCHEMA => {
                    let id = self.read_u16()?;
                    let name = self.read_str16()?;
                    let topic = self.read_str16()?;
                    let schema_json = String::from_utf8_lossy(&self.read_bytes32()?).into_owned();
                    self.channels.insert(
                        id,
                        ChannelInfo {
                            name,
                            topic,
                            schema_json,
                        },
                    );
                }
                REC_MESSAGE => {
                    let channel_id = self.read_u16()?;
                    let sequence = self.read_u32()?;
                    let log_time = self.read_u64()?;
                    let publish_time = self.read_u64()?;
                    let data = self.read_bytes32()?;
                    let topic = self
                        .channels
                        .get(&channel_id)
                        .ok_or(CaptureError::UnknownChannel(channel_id))?
                        .topic
                        .clone();
                    return Ok(Some(RawMessage {
                        channel_id,
                        topic,
                        sequence,
                        log_time,
                        publish_time,
                        data,
                    }));
                }
                other => {
                    return Err(CaptureError::Corrupt(format!("unknown record tag {other}")))
                }
            }
        }
    }

    fn read_u16(&mut self) -> CaptureResult<u16> {
        let mut b = [0u8; 2];
        self.file.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&mut self) -> CaptureResult<u32> {
        let mut b = [0u8; 4];
        self.file.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&mut self) -> CaptureResult<u64> {
        let mut b = [0u8; 8];
        self.file.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_str16(&mut self) -> CaptureResult<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn read_bytes32(&mut self) -> CaptureResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > 64 * 1024 * 1024 {
            return Err(CaptureError::Corrupt(format!("record of {len} bytes")));
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// =========================================================================
// Columnar decode
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    UInt64,
    Int64,
    Float64,
    Bool,
    /// Fixed-size byte field; strings are truncated to `size - 1` and
    /// null-terminated.
    Bytes(usize),
}

impl FieldType {
    pub fn size(&self) -> usize {
        match self {
            FieldType::UInt64 | FieldType::Int64 | FieldType::Float64 => 8,
            FieldType::Bool => 1,
            FieldType::Bytes(n) => *n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnField {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
}

/// Row layout for a nested array: `columns` elements of `elem_size` bytes,
/// each element holding the sub-fields.
#[derive(Debug, Clone)]
pub struct NestedArray {
    pub offset: usize,
    pub columns: usize,
    pub elem_size: usize,
    pub fields: Vec<ColumnField>,
}

/// Caller-described flat row schema. Field offsets are assigned in
/// declaration order; a `ts` field is mandatory and receives each
/// message's publish time.
#[derive(Debug, Clone, Default)]
pub struct ColumnSchema {
    fields: Vec<ColumnField>,
    nested: Option<NestedArray>,
    row_size: usize,
}

impl ColumnSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(ColumnField {
            name: name.to_string(),
            ty,
            offset: self.row_size,
        });
        self.row_size += ty.size();
        self
    }

    /// Declare the nested 2-D sub-buffer: `columns` elements, each with the
    /// given sub-fields.
    pub fn array(mut self, columns: usize, sub_fields: &[(&str, FieldType)]) -> Self {
        let mut fields = Vec::new();
        let mut elem_size = 0usize;
        for (name, ty) in sub_fields {
            fields.push(ColumnField {
                name: name.to_string(),
                ty: *ty,
                offset: elem_size,
            });
            elem_size += ty.size();
        }
        self.nested = Some(NestedArray {
            offset: self.row_size,
            columns,
            elem_size,
            fields,
        });
        self.row_size += columns * elem_size;
        self
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    fn lookup(&self, name: &str) -> Option<&ColumnField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Row-major destination buffer.
pub struct ColumnBuffer {
    schema: ColumnSchema,
    rows: usize,
    filled: usize,
    data: Vec<u8>,
}

impl ColumnBuffer {
    pub fn new(schema: ColumnSchema, rows: usize) -> Self {
        let data = vec![0u8; schema.row_size() * rows];
        Self {
            schema,
            rows,
            filled: 0,
            data,
        }
    }

    pub fn rows_filled(&self) -> usize {
        self.filled
    }

    pub fn u64_at(&self, row: usize, field: &str) -> Option<u64> {
        let f = self.schema.lookup(field)?;
        let off = row * self.schema.row_size + f.offset;
        Some(u64::from_le_bytes(
            self.data[off..off + 8].try_into().ok()?,
        ))
    }

    pub fn i64_at(&self, row: usize, field: &str) -> Option<i64> {
        let f = self.schema.lookup(field)?;
        let off = row * self.schema.row_size + f.offset;
        Some(i64::from_le_bytes(
            self.data[off..off + 8].try_into().ok()?,
        ))
    }

    pub fn f64_at(&self, row: usize, field: &str) -> Option<f64> {
        let f = self.schema.lookup(field)?;
        let off = row * self.schema.row_size + f.offset;
        Some(f64::from_le_bytes(
            self.data[off..off + 8].try_into().ok()?,
        ))
    }

    pub fn bool_at(&self, row: usize, field: &str) -> Option<bool> {
        let f = self.schema.lookup(field)?;
        Some(self.data[row * self.schema.row_size + f.offset] != 0)
    }

    /// Bytes up to the null terminator.
    pub fn str_at(&self, row: usize, field: &str) -> Option<String> {
        let f = self.schema.lookup(field)?;
        let size = f.ty.size();
        let off = row * self.schema.row_size + f.offset;
        let raw = &self.data[off..off + size];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(size);
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn nested_f64_at(&self, row: usize, index: usize, field: &str) -> Option<f64> {
        let nested = self.schema.nested.as_ref()?;
        let f = nested.fields.iter().find(|f| f.name == field)?;
        if index >= nested.columns {
            return None;
        }
        let off =
            row * self.schema.row_size + nested.offset + index * nested.elem_size + f.offset;
        Some(f64::from_le_bytes(
            self.data[off..off + 8].try_into().ok()?,
        ))
    }

    fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let size = self.schema.row_size;
        &mut self.data[row * size..(row + 1) * size]
    }
}

fn store_scalar(dst: &mut [u8], ty: FieldType, offset: usize, value: &Value) {
    match ty {
        FieldType::UInt64 => {
            if let Some(v) = value.as_u64() {
                dst[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            }
        }
        FieldType::Int64 => {
            if let Some(v) = value.as_i64() {
                dst[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            }
        }
        FieldType::Float64 => {
            if let Some(v) = value.as_f64() {
                dst[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            }
        }
        FieldType::Bool => {
            if let Some(v) = value.as_bool() {
                dst[offset] = v as u8;
            }
        }
        FieldType::Bytes(size) => {
            if let Some(s) = value.as_str() {
                let max_len = size.saturating_sub(1);
                let len = s.len().min(max_len);
                dst[offset..offset + len].copy_from_slice(&s.as_bytes()[..len]);
                dst[offset + len] = 0;
            }
        }
    }
}

/// Decode messages of `topic` starting at `start_time_ns` into `buf`.
/// Returns the number of rows filled; stops when the buffer is full.
pub fn read_into(
    path: &Path,
    topic: &str,
    start_time_ns: u64,
    buf: &mut ColumnBuffer,
) -> CaptureResult<usize> {
    if buf.schema.lookup("ts").is_none() {
        return Err(CaptureError::Corrupt(
            "column schema declares no ts field".into(),
        ));
    }

    let mut reader = CaptureReader::open(path)?;
    let schema = buf.schema.clone();
    let mut row = 0usize;

    while row < buf.rows {
        let Some(msg) = reader.next_message()? else {
            break;
        };
        if msg.topic != topic || msg.log_time < start_time_ns {
            continue;
        }
        let doc: Value = match serde_json::from_slice(&msg.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(sequence = msg.sequence, error = %e, "skipping unparsable message");
                continue;
            }
        };
        let Some(object) = doc.as_object() else {
            continue;
        };

        let dst = buf.row_mut(row);

        // publish time always lands in ts, it is not part of the body
        if let Some(ts_field) = schema.lookup("ts") {
            store_scalar(
                dst,
                ts_field.ty,
                ts_field.offset,
                &Value::from(msg.publish_time),
            );
        }

        for (name, value) in object {
            if value.is_null() || value.is_object() {
                continue;
            }
            if let (Some(items), Some(nested)) = (value.as_array(), schema.nested.as_ref()) {
                let Some(sub) = nested.fields.iter().find(|f| f.name == *name) else {
                    continue;
                };
                for (index, item) in items.iter().enumerate() {
                    if index >= nested.columns {
                        debug!(
                            field = %name,
                            len = items.len(),
                            columns = nested.columns,
                            "array exceeds nested column count, truncating"
                        );
                        break;
                    }
                    let elem_offset = nested.offset + index * nested.elem_size + sub.offset;
                    store_scalar(dst, sub.ty, elem_offset, item);
                }
                continue;
            }
            match schema.lookup(name) {
                Some(field) if field.name != "ts" => {
                    store_scalar(dst, field.ty, field.offset, value)
                }
                _ => {}
            }
        }
        row += 1;
    }

    buf.filled = row;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{CaptureMessage, CaptureWriter};

    fn write_sample_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("imu.mcap");
        let mut w = CaptureWriter::create(&path).unwrap();
        let imu = w.add_schema("imu_0", "imu", "{}").unwrap();
        let gps = w.add_schema("gps_0", "gps", "{}").unwrap();

        for (i, t) in [100u64, 200, 300].iter().enumerate() {
            let body = format!(
                "{{\"value\":{}.5,\"count\":{},\"name\":\"sensor-{}\",\"ok\":true,\"samples\":[1.0,2.0,3.0,4.0]}}",
                i, i, i
            );
            w.write_message(&CaptureMessage {
                channel_id: imu,
                sequence: i as u32,
                log_time: *t,
                publish_time: *t,
                data: body.as_bytes(),
            })
            .unwrap();
        }
        w.write_message(&CaptureMessage {
            channel_id: gps,
            sequence: 0,
            log_time: 150,
            publish_time: 150,
            data: b"{\"lat\":48.2}",
        })
        .unwrap();
        w.close().unwrap()
    }

    #[test]
    fn raw_iteration_in_log_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(dir.path());

        let mut r = CaptureReader::open(&path).unwrap();
        let mut sequences = Vec::new();
        let mut topics = Vec::new();
        while let Some(msg) = r.next_message().unwrap() {
            sequences.push(msg.sequence);
            topics.push(msg.topic);
        }
        assert_eq!(sequences, vec![0, 1, 2, 0]);
        assert_eq!(topics, vec!["imu", "imu", "imu", "gps"]);
        assert_eq!(r.channels().len(), 2);
    }

    #[test]
    fn columnar_decode_with_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(dir.path());

        let schema = ColumnSchema::new()
            .field("ts", FieldType::UInt64)
            .field("value", FieldType::Float64)
            .field("count", FieldType::Int64)
            .field("name", FieldType::Bytes(8))
            .field("ok", FieldType::Bool);
        let mut buf = ColumnBuffer::new(schema, 10);

        let rows = read_into(&path, "imu", 0, &mut buf).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(buf.u64_at(0, "ts"), Some(100));
        assert_eq!(buf.f64_at(1, "value"), Some(1.5));
        assert_eq!(buf.i64_at(2, "count"), Some(2));
        assert_eq!(buf.bool_at(0, "ok"), Some(true));
        // "sensor-0" truncated to 7 chars + NUL
        assert_eq!(buf.str_at(0, "name"), Some("sensor-".to_string()));
    }

    #[test]
    fn start_time_and_buffer_capacity_bound_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(dir.path());

        let schema = ColumnSchema::new().field("ts", FieldType::UInt64);
        let mut buf = ColumnBuffer::new(schema.clone(), 10);
        assert_eq!(read_into(&path, "imu", 150, &mut buf).unwrap(), 2);
        assert_eq!(buf.u64_at(0, "ts"), Some(200));

        let mut small = ColumnBuffer::new(schema, 1);
        assert_eq!(read_into(&path, "imu", 0, &mut small).unwrap(), 1);
        assert_eq!(small.u64_at(0, "ts"), Some(100));
    }

    #[test]
    fn nested_array_is_bounded_by_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(dir.path());

        let schema = ColumnSchema::new()
            .field("ts", FieldType::UInt64)
            .array(3, &[("samples", FieldType::Float64)]);
        let mut buf = ColumnBuffer::new(schema, 4);

        let rows = read_into(&path, "imu", 0, &mut buf).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(buf.nested_f64_at(0, 0, "samples"), Some(1.0));
        assert_eq!(buf.nested_f64_at(0, 2, "samples"), Some(3.0));
        // fourth element dropped
        assert_eq!(buf.nested_f64_at(0, 3, "samples"), None);
    }

    #[test]
    fn missing_ts_field_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(dir.path());
        let schema = ColumnSchema::new().field("value", FieldType::Float64);
        let mut buf = ColumnBuffer::new(schema, 1);
        assert!(read_into(&path, "imu", 0, &mut buf).is_err());
    }
}
