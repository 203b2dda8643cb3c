//! Indexes a complete log on a background thread.
//!
//! The thread walks every record once, tracking which positions belong to
//! which entry and collecting schemas. Consumers may query the index while
//! it is still being built; progress is published as [`IndexEvent`]s.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use anyhow::Result;
use kanal::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    datatype::DataType,
    log::SCHEMA_PREFIX,
    reader::{DataLogReader, DataLogRecord, RecordPosition, StartRecordData},
};

/// Records `[start, end)` of one start-to-finish lifetime of an entry.
/// `end` is the reader's end position while the entry is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRange {
    pub start: RecordPosition,
    pub end: RecordPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryData {
    pub name: String,
    pub r#type: String,
    pub data_type: DataType,
    pub metadata: String,
    /// Id of the most recent start.
    pub entry: i32,
    /// One range per start, in file order.
    pub ranges: Vec<RecordRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    /// A Start record was indexed.
    EntryAdded {
        entry: i32,
        name: String,
        r#type: String,
        metadata: String,
    },
    /// The whole buffer has been indexed.
    Done,
}

/// Schemas found in a log, keyed by type name without prefixes.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    structs: HashMap<String, Vec<u8>>,
    protos: HashMap<String, Vec<u8>>,
}

impl SchemaRegistry {
    /// Files a schema delivered for the schema entry `entry_name`.
    /// Returns `false` if the name is not a known schema path.
    pub fn register(&mut self, entry_name: &str, schema: &[u8]) -> bool {
        let name = entry_name.strip_prefix("NT:").unwrap_or(entry_name);
        let Some(name) = name.strip_prefix(SCHEMA_PREFIX) else {
            return false;
        };
        if let Some(name) = name.strip_prefix("struct:") {
            self.structs.insert(name.to_owned(), schema.to_vec());
        } else if let Some(name) = name.strip_prefix("proto:") {
            self.protos.insert(name.to_owned(), schema.to_vec());
        } else {
            return false;
        }
        true
    }

    #[must_use]
    pub fn struct_schema(&self, name: &str) -> Option<&[u8]> {
        self.structs.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn proto_descriptor(&self, name: &str) -> Option<&[u8]> {
        self.protos.get(name).map(Vec::as_slice)
    }

    pub fn struct_names(&self) -> impl Iterator<Item = &str> {
        self.structs.keys().map(String::as_str)
    }

    pub fn proto_names(&self) -> impl Iterator<Item = &str> {
        self.protos.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.structs.len() + self.protos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct IndexState {
    by_name: BTreeMap<String, EntryData>,
    /// Currently open ids; cleared by Finish.
    by_id: HashMap<i32, String>,
}

struct Shared {
    reader: DataLogReader,
    state: Mutex<IndexState>,
    schemas: Mutex<SchemaRegistry>,
    active: AtomicBool,
    done: AtomicBool,
    records: AtomicUsize,
}

pub struct DataLogReaderThread {
    shared: Arc<Shared>,
    events: Receiver<IndexEvent>,
    thread: Option<JoinHandle<()>>,
}

impl DataLogReaderThread {
    pub fn new(reader: DataLogReader) -> Result<Self> {
        let shared = Arc::new(Shared {
            reader,
            state: Mutex::new(IndexState::default()),
            schemas: Mutex::new(SchemaRegistry::default()),
            active: AtomicBool::new(true),
            done: AtomicBool::new(false),
            records: AtomicUsize::new(0),
        });
        let (sender, events) = kanal::unbounded();

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("datalog-index".into())
            .spawn(move || index_main(&thread_shared, &sender))?;

        Ok(DataLogReaderThread {
            shared,
            events,
            thread: Some(handle),
        })
    }

    #[must_use]
    pub fn reader(&self) -> &DataLogReader {
        &self.shared.reader
    }

    #[must_use]
    pub fn buffer_identifier(&self) -> &str {
        self.shared.reader.buffer_identifier()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Records indexed so far.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.shared.records.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.shared.state.lock().by_name.len()
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<EntryData> {
        self.shared.state.lock().by_name.get(name).cloned()
    }

    /// Snapshot of every entry seen so far, sorted by name.
    #[must_use]
    pub fn entries(&self) -> Vec<EntryData> {
        self.shared.state.lock().by_name.values().cloned().collect()
    }

    pub fn with_schemas<R>(&self, f: impl FnOnce(&SchemaRegistry) -> R) -> R {
        f(&self.shared.schemas.lock())
    }

    #[must_use]
    pub fn events(&self) -> &Receiver<IndexEvent> {
        &self.events
    }

    /// Events published since the last call, without blocking.
    #[must_use]
    pub fn poll_events(&self) -> Vec<IndexEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Records of a single range.
    pub fn records_in(&self, range: RecordRange) -> impl Iterator<Item = DataLogRecord<'_>> + '_ {
        self.shared
            .reader
            .records_at(range.start)
            .take_while(move |record| record.position() < range.end)
    }

    /// Blocks until indexing has finished.
    pub fn wait(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("data log index thread panicked");
            }
        }
    }
}

impl Drop for DataLogReaderThread {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Relaxed);
        self.wait();
    }
}

fn index_main(shared: &Shared, events: &Sender<IndexEvent>) {
    let reader = &shared.reader;
    debug!(buffer = reader.buffer_identifier(), "indexing data log");

    // schema entry id -> entry name
    let mut schema_entries: HashMap<i32, String> = HashMap::new();
    let mut count = 0;

    for record in reader.records() {
        if !shared.active.load(Ordering::Relaxed) {
            debug!("indexing cancelled");
            return;
        }
        count += 1;
        shared.records.store(count, Ordering::Relaxed);

        if record.is_start() {
            let Some(start) = record.start_data() else {
                warn!(position = record.position().offset(), "malformed start record");
                continue;
            };
            if DataType::parse(start.r#type).is_schema() {
                schema_entries.insert(start.entry, start.name.to_owned());
            }
            add_start(shared, &record, &start);
            let _ = events.send(IndexEvent::EntryAdded {
                entry: start.entry,
                name: start.name.to_owned(),
                r#type: start.r#type.to_owned(),
                metadata: start.metadata.to_owned(),
            });
        } else if let Some(entry) = record.finish_entry() {
            let mut state = shared.state.lock();
            let Some(name) = state.by_id.remove(&entry) else {
                warn!(entry, "finish for unknown entry id");
                continue;
            };
            if let Some(range) = state
                .by_name
                .get_mut(&name)
                .and_then(|data| data.ranges.last_mut())
            {
                range.end = record.position();
            }
            schema_entries.remove(&entry);
        } else if let Some(data) = record.set_metadata_data() {
            let mut state = shared.state.lock();
            let IndexState { by_name, by_id } = &mut *state;
            match by_id.get(&data.entry).and_then(|name| by_name.get_mut(name)) {
                Some(entry) => data.metadata.clone_into(&mut entry.metadata),
                None => warn!(entry = data.entry, "set metadata for unknown entry id"),
            }
        } else if record.is_control() {
            warn!(
                position = record.position().offset(),
                tag = ?record.raw().first(),
                "unrecognized control record"
            );
        } else if let Some(name) = schema_entries.get(&record.entry()) {
            if !shared.schemas.lock().register(name, record.raw()) {
                debug!(%name, "schema entry with unrecognized name");
            }
        }
    }

    shared.done.store(true, Ordering::Release);
    debug!(records = count, "finished indexing data log");
    let _ = events.send(IndexEvent::Done);
}

fn add_start(shared: &Shared, record: &DataLogRecord<'_>, start: &StartRecordData<'_>) {
    let end = shared.reader.end_position();
    let mut state = shared.state.lock();
    let IndexState { by_name, by_id } = &mut *state;

    if let Some(previous) = by_id.insert(start.entry, start.name.to_owned()) {
        // a resumed stream replays the starts of entries that are still open
        if previous != start.name {
            warn!(
                entry = start.entry,
                previous = %previous,
                name = start.name,
                "duplicate start for entry id, overriding"
            );
        }
        if let Some(range) = by_name
            .get_mut(&previous)
            .and_then(|data| data.ranges.last_mut())
            .filter(|range| range.end == end)
        {
            range.end = record.position();
        }
    }

    let range = RecordRange {
        start: record.position(),
        end,
    };
    match by_name.get_mut(start.name) {
        Some(data) => {
            if data.r#type != start.r#type {
                warn!(
                    name = start.name,
                    existing = %data.r#type,
                    requested = start.r#type,
                    "entry restarted with a different type"
                );
            }
            data.entry = start.entry;
            start.metadata.clone_into(&mut data.metadata);
            data.ranges.push(range);
        }
        None => {
            by_name.insert(
                start.name.to_owned(),
                EntryData {
                    name: start.name.to_owned(),
                    r#type: start.r#type.to_owned(),
                    data_type: DataType::parse(start.r#type),
                    metadata: start.metadata.to_owned(),
                    entry: start.entry,
                    ranges: vec![range],
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec,
        writer::tests::{flushed, test_writer},
    };

    fn index(data: Vec<u8>) -> DataLogReaderThread {
        let mut thread = DataLogReaderThread::new(DataLogReader::new(data)).unwrap();
        thread.wait();
        thread
    }

    #[test]
    fn ranges_follow_start_and_finish() {
        let writer = test_writer();
        let a = writer.start("a", "int64", "", 1);
        writer.append_integer(a, 1, 2);
        writer.finish(a, 3);
        let again = writer.start("a", "int64", "second", 4);
        writer.append_integer(again, 2, 5);
        writer.append_integer(again, 3, 6);
        let data = flushed(&writer);

        let index = index(data);
        assert!(index.is_done());
        assert_eq!(index.record_count(), 6);
        assert_eq!(index.entry_count(), 1);

        let entry = index.entry("a").unwrap();
        assert_eq!(entry.data_type, DataType::Integer);
        assert_eq!(entry.metadata, "second");
        assert_eq!(entry.ranges.len(), 2);
        assert_eq!(entry.ranges[1].end, index.reader().end_position());

        let first: Vec<_> = index
            .records_in(entry.ranges[0])
            .filter_map(|r| r.get_integer())
            .collect();
        assert_eq!(first, vec![1]);
        let second: Vec<_> = index
            .records_in(entry.ranges[1])
            .filter(|r| !r.is_control())
            .filter_map(|r| r.get_integer())
            .collect();
        assert_eq!(second, vec![2, 3]);
    }

    #[test]
    fn events_are_published() {
        let writer = test_writer();
        writer.start("a", "double", "m", 1);
        writer.start("b", "string", "", 1);
        let index = index(flushed(&writer));

        let events = index.poll_events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            IndexEvent::EntryAdded {
                entry: 1,
                name: "a".into(),
                r#type: "double".into(),
                metadata: "m".into(),
            }
        );
        assert_eq!(events[2], IndexEvent::Done);
        assert!(index.poll_events().is_empty());
    }

    #[test]
    fn set_metadata_updates_entry() {
        let writer = test_writer();
        let a = writer.start("a", "double", "first", 1);
        writer.set_metadata(a, "second", 2);
        let index = index(flushed(&writer));
        assert_eq!(index.entry("a").unwrap().metadata, "second");
    }

    #[test]
    fn duplicate_start_overrides() {
        let mut data = codec::file_header(b"");
        for (name, ts) in [("a", 1u64), ("b", 2)] {
            let payload = codec::encode_start_payload(1, name, "int64", "");
            let mut header = [0; codec::RECORD_MAX_HEADER_SIZE];
            let len = codec::write_record_header(&mut header, 0, ts, payload.len() as u32);
            data.extend_from_slice(&header[..len]);
            data.extend_from_slice(&payload);
        }

        let index = index(data);
        let a = index.entry("a").unwrap();
        let b = index.entry("b").unwrap();
        assert_eq!(a.ranges[0].end, b.ranges[0].start);
        assert_eq!(b.ranges[0].end, index.reader().end_position());
    }

    #[test]
    fn schemas_are_registered() {
        let writer = test_writer();
        writer.add_schema_str("struct:ThingA", "structschema", "uint8 value", 1);
        let nt = writer.start("NT:/.schema/struct:ThingB", "structschema", "", 1);
        writer.append_string(nt, "int16 b", 1);
        writer.add_schema("proto:Foo", "proto:FileDescriptorProto", &[1, 2, 3], 1);
        let index = index(flushed(&writer));

        index.with_schemas(|schemas| {
            assert_eq!(schemas.len(), 3);
            assert_eq!(schemas.struct_schema("ThingA"), Some(&b"uint8 value"[..]));
            assert_eq!(schemas.struct_schema("ThingB"), Some(&b"int16 b"[..]));
            assert_eq!(schemas.proto_descriptor("Foo"), Some(&[1u8, 2, 3][..]));
        });
    }

    #[test]
    fn registry_ignores_unknown_paths() {
        let mut schemas = SchemaRegistry::default();
        assert!(!schemas.register("/.schema/other:X", b""));
        assert!(!schemas.register("struct:X", b""));
        assert!(schemas.register("NT:/.schema/proto:X", b"d"));
        assert_eq!(schemas.proto_names().collect::<Vec<_>>(), vec!["X"]);
    }

    #[test]
    fn invalid_buffer_finishes_immediately() {
        let index = index(b"not a log".to_vec());
        assert!(index.is_done());
        assert_eq!(index.entry_count(), 0);
        assert_eq!(index.poll_events(), vec![IndexEvent::Done]);
    }
}
