use anyhow::{format_err, Result};
use core::str;
use memmap2::Mmap;
use std::{fmt, fs::File, ops::Deref, path::Path, sync::Arc};

use crate::{
    codec::{
        self, CONTROL_FINISH, CONTROL_SET_METADATA, CONTROL_START, FILE_HEADER_SIZE,
        FINISH_PAYLOAD_SIZE, SET_METADATA_PAYLOAD_MIN_SIZE, START_PAYLOAD_MIN_SIZE,
    },
    ControlData, Record, RecordInfo, HEADER_STRING, HEADER_VERSION,
};

#[derive(Clone)]
enum Storage {
    Shared(Arc<[u8]>),
    Mapped(Arc<Mmap>),
}

impl Deref for Storage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Storage::Shared(data) => &data[..],
            Storage::Mapped(map) => &map[..],
        }
    }
}

/// Reads records out of a complete, immutable log buffer.
///
/// The reader holds no cursor of its own; every [`RecordIter`] re-parses
/// headers from a byte offset, so positions can be stored and revisited.
/// Cloning is cheap since the buffer is shared.
#[derive(Clone)]
pub struct DataLogReader {
    buf: Storage,
    identifier: String,
}

impl fmt::Debug for DataLogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLogReader")
            .field("identifier", &self.identifier)
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl DataLogReader {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self::with_identifier(data, "")
    }

    pub fn with_identifier(data: impl Into<Arc<[u8]>>, identifier: impl Into<String>) -> Self {
        DataLogReader {
            buf: Storage::Shared(data.into()),
            identifier: identifier.into(),
        }
    }

    /// Memory-maps `path`. The file must not be truncated while the reader
    /// (or anything cloned from it) is alive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the map is read-only; callers are told not to truncate the
        // file underneath it
        let map = unsafe { Mmap::map(&file)? };
        Ok(DataLogReader {
            buf: Storage::Mapped(Arc::new(map)),
            identifier: path.display().to_string(),
        })
    }

    /// Name of where the buffer came from (the path for [`open`](Self::open)).
    #[must_use]
    pub fn buffer_identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Checks the magic and version. Says nothing about the records.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.buf.len() >= FILE_HEADER_SIZE
            && self.buf[..6] == *HEADER_STRING
            && self.version() >= HEADER_VERSION
    }

    /// File format version, major in the high byte; 0 if the buffer is too
    /// short to hold one.
    #[must_use]
    pub fn version(&self) -> u16 {
        match self.buf.get(6..8) {
            Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
            _ => 0,
        }
    }

    #[must_use]
    pub fn extra_header_bytes(&self) -> &[u8] {
        let Some(len) = self.buf.get(8..).and_then(codec::read_u32) else {
            return &[];
        };
        self.buf
            .get(FILE_HEADER_SIZE..FILE_HEADER_SIZE + len as usize)
            .unwrap_or_default()
    }

    /// The extra header as text; empty if it is not valid UTF-8.
    #[must_use]
    pub fn extra_header(&self) -> &str {
        str::from_utf8(self.extra_header_bytes()).unwrap_or_default()
    }

    fn first_record(&self) -> Option<usize> {
        if !self.is_valid() {
            return None;
        }
        let len = codec::read_u32(&self.buf[8..])? as usize;
        let start = FILE_HEADER_SIZE.checked_add(len)?;
        (start <= self.buf.len()).then_some(start)
    }

    /// Iterates every record after the file header. Yields nothing if the
    /// buffer is not a valid log.
    #[must_use]
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            reader: self,
            pos: self.first_record().unwrap_or(self.buf.len()),
        }
    }

    /// Iterates from a position previously taken from a record.
    #[must_use]
    pub fn records_at(&self, position: RecordPosition) -> RecordIter<'_> {
        RecordIter {
            reader: self,
            pos: position.0,
        }
    }

    /// The position of the first record, if the buffer is a valid log.
    #[must_use]
    pub fn first_position(&self) -> Option<RecordPosition> {
        self.first_record().map(RecordPosition)
    }

    /// Position one past the last byte, where every iteration ends.
    #[must_use]
    pub fn end_position(&self) -> RecordPosition {
        RecordPosition(self.buf.len())
    }

    /// Decodes the record starting at `position`.
    ///
    /// Fails if the header is truncated or the payload runs past the end of
    /// the buffer.
    #[must_use]
    pub fn record_at(&self, position: RecordPosition) -> Option<DataLogRecord<'_>> {
        let buf = self.buf.get(position.0..)?;
        let header = codec::read_record_header(buf)?;
        let end = header.len.checked_add(header.payload_size as usize)?;
        let data = buf.get(header.len..end)?;

        Some(DataLogRecord {
            entry: header.entry as i32,
            timestamp: header.timestamp as i64,
            data,
            position,
            next: RecordPosition(position.0 + end),
        })
    }
}

/// Byte offset of a record within its reader's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPosition(pub(crate) usize);

impl RecordPosition {
    #[must_use]
    pub fn offset(self) -> usize {
        self.0
    }
}

pub struct RecordIter<'a> {
    reader: &'a DataLogReader,
    pos: usize,
}

impl<'a> RecordIter<'a> {
    /// Where the next call to `next` starts parsing.
    #[must_use]
    pub fn position(&self) -> RecordPosition {
        RecordPosition(self.pos)
    }

    #[must_use]
    pub fn reader(&self) -> &'a DataLogReader {
        self.reader
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = DataLogRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.record_at(RecordPosition(self.pos)) {
            Some(record) => {
                self.pos = record.next.0;
                Some(record)
            }
            None => {
                // truncated or finished, either way there is nothing more to read
                self.pos = self.reader.buf.len();
                None
            }
        }
    }
}

impl std::iter::FusedIterator for RecordIter<'_> {}

/// A record borrowed from a [`DataLogReader`] buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataLogRecord<'a> {
    entry: i32,
    timestamp: i64,
    data: &'a [u8],
    position: RecordPosition,
    next: RecordPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRecordData<'a> {
    pub entry: i32,
    pub name: &'a str,
    pub r#type: &'a str,
    pub metadata: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecordData<'a> {
    pub entry: i32,
    pub metadata: &'a str,
}

impl<'a> DataLogRecord<'a> {
    #[must_use]
    pub fn entry(&self) -> i32 {
        self.entry
    }

    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub fn position(&self) -> RecordPosition {
        self.position
    }

    #[must_use]
    pub fn next_position(&self) -> RecordPosition {
        self.next
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.entry == 0
    }

    fn control_type(&self) -> Option<u8> {
        if self.is_control() {
            self.data.first().copied()
        } else {
            None
        }
    }

    fn control_entry(&self) -> Option<i32> {
        codec::read_u32(self.data.get(1..)?).map(|id| id as i32)
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        self.control_type() == Some(CONTROL_START) && self.data.len() >= START_PAYLOAD_MIN_SIZE
    }

    #[must_use]
    pub fn is_finish(&self) -> bool {
        self.control_type() == Some(CONTROL_FINISH) && self.data.len() == FINISH_PAYLOAD_SIZE
    }

    #[must_use]
    pub fn is_set_metadata(&self) -> bool {
        self.control_type() == Some(CONTROL_SET_METADATA)
            && self.data.len() >= SET_METADATA_PAYLOAD_MIN_SIZE
    }

    #[must_use]
    pub fn start_data(&self) -> Option<StartRecordData<'a>> {
        if !self.is_start() {
            return None;
        }
        let entry = self.control_entry()?;
        let mut rest = &self.data[5..];
        let name = str::from_utf8(codec::read_string(&mut rest)?).ok()?;
        let r#type = str::from_utf8(codec::read_string(&mut rest)?).ok()?;
        let metadata = str::from_utf8(codec::read_string(&mut rest)?).ok()?;

        Some(StartRecordData {
            entry,
            name,
            r#type,
            metadata,
        })
    }

    #[must_use]
    pub fn finish_entry(&self) -> Option<i32> {
        if !self.is_finish() {
            return None;
        }
        self.control_entry()
    }

    #[must_use]
    pub fn set_metadata_data(&self) -> Option<MetadataRecordData<'a>> {
        if !self.is_set_metadata() {
            return None;
        }
        let entry = self.control_entry()?;
        let mut rest = &self.data[5..];
        let metadata = str::from_utf8(codec::read_string(&mut rest)?).ok()?;

        Some(MetadataRecordData { entry, metadata })
    }

    #[must_use]
    pub fn get_boolean(&self) -> Option<bool> {
        match self.data {
            [value] => Some(*value != 0),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_integer(&self) -> Option<i64> {
        self.data.try_into().ok().map(i64::from_le_bytes)
    }

    #[must_use]
    pub fn get_float(&self) -> Option<f32> {
        self.data.try_into().ok().map(f32::from_le_bytes)
    }

    #[must_use]
    pub fn get_double(&self) -> Option<f64> {
        self.data.try_into().ok().map(f64::from_le_bytes)
    }

    /// The whole payload as text.
    #[must_use]
    pub fn get_string(&self) -> Option<&'a str> {
        str::from_utf8(self.data).ok()
    }

    #[must_use]
    pub fn get_boolean_array(&self) -> Option<Vec<bool>> {
        Some(self.data.iter().map(|&b| b != 0).collect())
    }

    #[must_use]
    pub fn get_integer_array(&self) -> Option<Vec<i64>> {
        decode_array(self.data, i64::from_le_bytes)
    }

    #[must_use]
    pub fn get_float_array(&self) -> Option<Vec<f32>> {
        decode_array(self.data, f32::from_le_bytes)
    }

    #[must_use]
    pub fn get_double_array(&self) -> Option<Vec<f64>> {
        decode_array(self.data, f64::from_le_bytes)
    }

    /// Fails on a count that cannot fit, a string running past the payload,
    /// or bytes left over after the last string.
    #[must_use]
    pub fn get_string_array(&self) -> Option<Vec<&'a str>> {
        let count = codec::read_u32(self.data)? as usize;
        if count > (self.data.len() - 4) / 4 {
            return None;
        }

        let mut rest = &self.data[4..];
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(str::from_utf8(codec::read_string(&mut rest)?).ok()?);
        }
        if !rest.is_empty() {
            return None;
        }
        Some(values)
    }
}

fn decode_array<T, const N: usize>(data: &[u8], decode: fn([u8; N]) -> T) -> Option<Vec<T>> {
    if data.len() % N != 0 {
        return None;
    }
    Some(
        data.chunks_exact(N)
            .map(|chunk| {
                let mut bytes = [0; N];
                bytes.copy_from_slice(chunk);
                decode(bytes)
            })
            .collect(),
    )
}

impl TryFrom<DataLogRecord<'_>> for Record {
    type Error = anyhow::Error;

    fn try_from(record: DataLogRecord<'_>) -> std::result::Result<Self, Self::Error> {
        if !record.is_control() {
            return Ok(Record {
                entry: record.entry,
                timestamp: record.timestamp,
                info: RecordInfo::Data(record.data.into()),
            });
        }

        let (entry, info) = match record.control_type() {
            Some(CONTROL_START) => {
                let start = record
                    .start_data()
                    .ok_or_else(|| format_err!("Malformed start record"))?;
                let info = ControlData::Start {
                    name: start.name.into(),
                    r#type: start.r#type.into(),
                    metadata: start.metadata.into(),
                };
                (start.entry, info)
            }
            Some(CONTROL_FINISH) => {
                let entry = record
                    .finish_entry()
                    .ok_or_else(|| format_err!("Malformed finish record"))?;
                (entry, ControlData::Finish)
            }
            Some(CONTROL_SET_METADATA) => {
                let data = record
                    .set_metadata_data()
                    .ok_or_else(|| format_err!("Malformed set metadata record"))?;
                (data.entry, ControlData::SetMetadata(data.metadata.into()))
            }
            Some(tag) => return Err(format_err!("Invalid Control Record Type: {tag}")),
            None => return Err(format_err!("Empty control record")),
        };

        Ok(Record {
            entry,
            timestamp: record.timestamp,
            info: RecordInfo::Control(info),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::{flushed, test_writer};
    use proptest::prelude::*;

    fn sample_log() -> Vec<u8> {
        let writer = test_writer();
        let a = writer.start("a", "int64", "meta", 5);
        let b = writer.start("b", "string[]", "", 5);
        writer.append_integer(a, -4, 7);
        writer.append_string_array(b, &["x", "", "yz"], 8);
        writer.set_metadata(a, "changed", 9);
        writer.finish(a, 10);
        flushed(&writer)
    }

    #[test]
    fn header_checks() {
        assert!(!DataLogReader::new(Vec::new()).is_valid());
        assert!(!DataLogReader::new(b"WPILOG\x00\x01\x00\x00\x00".to_vec()).is_valid());
        assert!(!DataLogReader::new(b"WPILOX\x00\x01\x00\x00\x00\x00".to_vec()).is_valid());
        assert!(!DataLogReader::new(b"WPILOG\x00\x00\x00\x00\x00\x00".to_vec()).is_valid());

        let reader = DataLogReader::new(b"WPILOG\x00\x01\x00\x00\x00\x00".to_vec());
        assert!(reader.is_valid());
        assert_eq!(reader.version(), 0x0100);
        assert_eq!(reader.records().count(), 0);
    }

    #[test]
    fn extra_header_past_end_yields_no_records() {
        let mut data = codec::file_header(b"abc");
        data[8] = 200;
        let reader = DataLogReader::new(data);
        assert!(reader.is_valid());
        assert!(reader.extra_header_bytes().is_empty());
        assert_eq!(reader.records().count(), 0);
    }

    #[test]
    fn control_records() {
        let reader = DataLogReader::new(sample_log());
        let records: Vec<_> = reader.records().collect();
        assert_eq!(records.len(), 6);

        let start = records[0].start_data().unwrap();
        assert_eq!(
            start,
            StartRecordData {
                entry: 1,
                name: "a",
                r#type: "int64",
                metadata: "meta",
            }
        );
        assert_eq!(records[1].start_data().unwrap().r#type, "string[]");

        let meta = records[4].set_metadata_data().unwrap();
        assert_eq!(meta.entry, 1);
        assert_eq!(meta.metadata, "changed");
        assert!(!records[4].is_start());
        assert_eq!(records[4].finish_entry(), None);

        assert_eq!(records[5].finish_entry(), Some(1));
        assert_eq!(records[5].timestamp(), 10);
    }

    #[test]
    fn data_records() {
        let reader = DataLogReader::new(sample_log());
        let records: Vec<_> = reader.records().collect();

        assert_eq!(records[2].get_integer(), Some(-4));
        assert_eq!(records[2].get_boolean(), None);
        assert_eq!(records[2].get_float(), None);
        assert!(!records[2].is_control());

        assert_eq!(records[3].get_string_array(), Some(vec!["x", "", "yz"]));
        assert_eq!(records[3].timestamp(), 8);
    }

    #[test]
    fn string_array_rejects_leftovers_and_overlong_counts() {
        let make = |payload: &[u8]| {
            let mut data = codec::file_header(b"");
            let mut header = [0; codec::RECORD_MAX_HEADER_SIZE];
            let len = codec::write_record_header(&mut header, 1, 1, payload.len() as u32);
            data.extend_from_slice(&header[..len]);
            data.extend_from_slice(payload);
            DataLogReader::new(data)
        };

        let reader = make(&[1, 0, 0, 0, 1, 0, 0, 0, b'a', 0xff]);
        let record = reader.records().next().unwrap();
        assert_eq!(record.get_string_array(), None);

        let reader = make(&[9, 0, 0, 0, 0, 0, 0, 0]);
        let record = reader.records().next().unwrap();
        assert_eq!(record.get_string_array(), None);

        let reader = make(&[0, 0, 0, 0]);
        let record = reader.records().next().unwrap();
        assert_eq!(record.get_string_array(), Some(vec![]));
    }

    #[test]
    fn array_strides_are_checked() {
        let writer = test_writer();
        let e = writer.start("a", "raw", "", 1);
        writer.append_raw(e, &[0; 12], 2);
        let reader = DataLogReader::new(flushed(&writer));
        let record = reader.records().nth(1).unwrap();

        assert_eq!(record.get_float_array().map(|v| v.len()), Some(3));
        assert_eq!(record.get_integer_array(), None);
        assert_eq!(record.get_double_array(), None);
        assert_eq!(record.get_boolean_array().map(|v| v.len()), Some(12));
    }

    #[test]
    fn truncated_buffers_stop_cleanly() {
        let data = sample_log();
        let full = DataLogReader::new(data.clone()).records().count();
        for len in 0..data.len() {
            let reader = DataLogReader::new(&data[..len]);
            let count = reader.records().count();
            assert!(count <= full);
            if len < data.len() {
                assert!(count < full, "truncation at {len} yielded every record");
            }
        }
    }

    #[test]
    fn positions_are_revisitable() {
        let reader = DataLogReader::new(sample_log());
        let third = reader.records().nth(2).unwrap();
        let again = reader.record_at(third.position()).unwrap();
        assert_eq!(again, third);

        let rest: Vec<_> = reader.records_at(third.next_position()).collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(reader.records_at(reader.end_position()).count(), 0);
    }

    #[test]
    fn owned_records() {
        let reader = DataLogReader::new(sample_log());
        let records: Vec<Record> = reader
            .records()
            .map(Record::try_from)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(
            records[0].info,
            RecordInfo::Control(ControlData::Start {
                name: "a".into(),
                r#type: "int64".into(),
                metadata: "meta".into(),
            })
        );
        assert_eq!(records[0].entry, 1);
        let value = (-4i64).to_le_bytes().to_vec().into_boxed_slice();
        assert_eq!(records[2].info, RecordInfo::Data(value));
        assert_eq!(records[5].info, RecordInfo::Control(ControlData::Finish));
    }

    #[test]
    fn bad_control_tag_is_an_error() {
        let mut data = codec::file_header(b"");
        data.extend_from_slice(&[0x00, 0x00, 0x05, 0x01, 9, 1, 0, 0, 0]);
        let reader = DataLogReader::new(data);
        let record = reader.records().next().unwrap();
        assert!(record.is_control());
        assert!(!record.is_start() && !record.is_finish() && !record.is_set_metadata());
        assert!(Record::try_from(record).is_err());
    }

    #[test]
    fn open_maps_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.wpilog");
        std::fs::write(&path, sample_log()).unwrap();

        let reader = DataLogReader::open(&path).unwrap();
        assert!(reader.is_valid());
        assert_eq!(reader.records().count(), 6);
        assert!(reader.buffer_identifier().ends_with("mapped.wpilog"));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_read_out_of_bounds(
            body in proptest::collection::vec(any::<u8>(), 0..512)
        ) {
            let mut data = codec::file_header(b"");
            data.extend_from_slice(&body);
            let reader = DataLogReader::new(data);
            let mut end = 0;
            for record in reader.records() {
                prop_assert!(record.next_position().offset() <= reader.data().len());
                prop_assert!(record.next_position() > record.position());
                end = record.next_position().offset();
                let _ = record.start_data();
                let _ = record.get_string_array();
            }
            prop_assert!(end <= reader.data().len());
        }
    }
}
