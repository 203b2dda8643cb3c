//! The format-aware logging engine shared by both writers.
//!
//! [`DataLog`] assigns entry ids, emits control records, encodes appends into
//! the [`BufferPool`], and replays every open entry when a file starts so a
//! reader never needs context from outside the file. It never touches I/O;
//! draining the buffers is the owning writer's job.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, warn};

use crate::{
    background::WriterSignals,
    buffer::{Buffer, BufferPool, MAX_BUFFER_COUNT},
    clock::TimeProvider,
    codec::{self, RECORD_MAX_HEADER_SIZE},
};

/// Prefix of every schema entry name.
pub const SCHEMA_PREFIX: &str = "/.schema/";

/// Hooks a writer installs to react to buffer pressure. Both are called with
/// the log's lock held.
pub(crate) trait Backend: Send + Sync {
    /// The outgoing queue just reached half its capacity.
    fn buffer_half_full(&self, _state: &mut LogState) {}

    /// The outgoing queue is at capacity. Returning `true` pauses the log
    /// and drops the append that hit the limit.
    fn buffer_full(&self, state: &mut LogState) -> bool;
}

#[derive(Debug)]
struct EntryInfo {
    name: String,
    r#type: String,
    metadata: String,
    schema: Option<Vec<u8>>,
    refcount: usize,
    /// Data was queued while the log was inactive.
    buffered: bool,
    /// Finished while inactive after data was queued; the Finish record is
    /// written by the next `start_file`.
    finished_at: Option<i64>,
}

pub(crate) struct LogState {
    pub(crate) pool: BufferPool,
    /// Indexed by `id - 1`; ids are handed out densely and never reused.
    entries: Vec<EntryInfo>,
    by_name: HashMap<String, i32>,
    pub(crate) active: bool,
    pub(crate) paused: bool,
    half_full_signaled: bool,
    pub(crate) writer: WriterSignals,
}

impl LogState {
    fn entry_mut(&mut self, entry: i32) -> Option<&mut EntryInfo> {
        let index = usize::try_from(entry).ok()?.checked_sub(1)?;
        self.entries.get_mut(index)
    }

    fn is_live(&self, entry: i32) -> bool {
        usize::try_from(entry)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| self.entries.get(index))
            .is_some_and(|info| info.refcount > 0)
    }
}

pub struct DataLog {
    state: Mutex<LogState>,
    wake: Condvar,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn TimeProvider + Send + Sync>,
    extra_header: String,
}

impl DataLog {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn TimeProvider + Send + Sync>,
        extra_header: &str,
    ) -> Self {
        DataLog {
            state: Mutex::new(LogState {
                pool: BufferPool::new(),
                entries: Vec::new(),
                by_name: HashMap::new(),
                active: false,
                paused: false,
                half_full_signaled: false,
                writer: WriterSignals::default(),
            }),
            wake: Condvar::new(),
            backend,
            clock,
            extra_header: extra_header.to_owned(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock()
    }

    /// Wakes the background writer, if there is one.
    pub(crate) fn wake(&self) -> &Condvar {
        &self.wake
    }

    #[must_use]
    pub fn extra_header(&self) -> &str {
        &self.extra_header
    }

    fn resolve_timestamp(&self, timestamp: i64) -> u64 {
        if timestamp == 0 {
            self.clock.get_time() as u64
        } else {
            timestamp as u64
        }
    }

    /// Starts an entry and returns its id.
    ///
    /// Starting a name that is already open with the same type returns the
    /// same id and bumps its open count; each start needs a matching
    /// [`finish`](Self::finish). Starting a name with a different type than
    /// it was first started with is rejected and returns 0.
    pub fn start(&self, name: &str, r#type: &str, metadata: &str, timestamp: i64) -> i32 {
        let mut state = self.state.lock();
        self.start_impl(&mut state, name, r#type, metadata, timestamp)
    }

    fn start_impl(
        &self,
        state: &mut LogState,
        name: &str,
        r#type: &str,
        metadata: &str,
        timestamp: i64,
    ) -> i32 {
        let id = if let Some(&id) = state.by_name.get(name) {
            let Some(info) = state.entry_mut(id) else {
                return 0;
            };
            if info.r#type != r#type {
                error!(
                    name,
                    existing = %info.r#type,
                    requested = r#type,
                    "type mismatch starting entry, ignoring"
                );
                return 0;
            }
            info.refcount += 1;
            if info.refcount > 1 {
                return id;
            }
            info.finished_at = None;
            metadata.clone_into(&mut info.metadata);
            id
        } else {
            let id = state.entries.len() as i32 + 1;
            state.entries.push(EntryInfo {
                name: name.to_owned(),
                r#type: r#type.to_owned(),
                metadata: metadata.to_owned(),
                schema: None,
                refcount: 1,
                buffered: false,
                finished_at: None,
            });
            state.by_name.insert(name.to_owned(), id);
            id
        };

        if state.active {
            let payload = codec::encode_start_payload(id, name, r#type, metadata);
            self.write_record(state, 0, timestamp, &payload);
        }
        id
    }

    /// Finishes one [`start`](Self::start) of an entry. The Finish record is
    /// written when the last open start is finished.
    pub fn finish(&self, entry: i32, timestamp: i64) {
        if entry <= 0 {
            return;
        }
        let mut state = self.state.lock();
        let active = state.active;
        {
            let Some(info) = state.entry_mut(entry) else {
                return;
            };
            if info.refcount == 0 {
                return;
            }
            info.refcount -= 1;
            if info.refcount > 0 {
                return;
            }
            if !active && info.buffered {
                info.finished_at = Some(self.resolve_timestamp(timestamp) as i64);
            }
        }
        if active {
            let payload = codec::encode_finish_payload(entry);
            self.write_record(&mut state, 0, timestamp, &payload);
        }
    }

    pub fn set_metadata(&self, entry: i32, metadata: &str, timestamp: i64) {
        if entry <= 0 {
            return;
        }
        let mut state = self.state.lock();
        {
            let Some(info) = state.entry_mut(entry) else {
                return;
            };
            metadata.clone_into(&mut info.metadata);
        }
        if state.active {
            let payload = codec::encode_set_metadata_payload(entry, metadata);
            self.write_record(&mut state, 0, timestamp, &payload);
        }
    }

    /// Registers a schema as the entry `/.schema/{name}`.
    ///
    /// Only the first registration of a name is kept; later calls are
    /// ignored even if the schema differs.
    pub fn add_schema(&self, name: &str, r#type: &str, schema: &[u8], timestamp: i64) {
        let full_name = format!("{SCHEMA_PREFIX}{name}");
        let mut state = self.state.lock();
        if state.by_name.contains_key(&full_name) {
            return;
        }

        let id = self.start_impl(&mut state, &full_name, r#type, "", timestamp);
        if let Some(info) = state.entry_mut(id) {
            info.schema = Some(schema.to_vec());
        }
        // the schema is needed to decode everything after it, so it is
        // written even while paused
        if state.active {
            self.write_record(&mut state, id, timestamp, schema);
        }
    }

    pub fn add_schema_str(&self, name: &str, r#type: &str, schema: &str, timestamp: i64) {
        self.add_schema(name, r#type, schema.as_bytes(), timestamp);
    }

    #[must_use]
    pub fn has_schema(&self, name: &str) -> bool {
        self.state
            .lock()
            .by_name
            .contains_key(&format!("{SCHEMA_PREFIX}{name}"))
    }

    /// The type an entry name was first started with.
    #[must_use]
    pub fn entry_type(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        let id = *state.by_name.get(name)?;
        state.entries.get(id as usize - 1).map(|e| e.r#type.clone())
    }

    #[must_use]
    pub fn entry_metadata(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        let id = *state.by_name.get(name)?;
        state.entries.get(id as usize - 1).map(|e| e.metadata.clone())
    }

    /// Drops appends until [`resume`](Self::resume). Control records are
    /// still written.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Begins a file: queues the file header and a Start record (plus schema
    /// data) for every open entry ahead of anything already buffered.
    /// Does nothing if a file is already active.
    pub fn start_file(&self) {
        self.activate(true);
    }

    /// Reactivates the log within a stream that already has its file
    /// header: replays the open entries without writing another header.
    pub(crate) fn continue_stream(&self) {
        self.activate(false);
    }

    fn activate(&self, with_header: bool) {
        let mut state = self.state.lock();
        if state.active {
            return;
        }
        state.active = true;

        let timestamp = self.resolve_timestamp(0);
        let header = codec::file_header(self.extra_header.as_bytes());
        let LogState { pool, entries, .. } = &mut *state;
        pool.write_prefix(|pool| {
            if with_header {
                pool.append(&header);
            }
            for (index, info) in entries.iter().enumerate() {
                if info.refcount == 0 && !info.buffered {
                    continue;
                }
                let id = index as i32 + 1;
                let payload =
                    codec::encode_start_payload(id, &info.name, &info.r#type, &info.metadata);
                put_record(pool, 0, timestamp, &payload);
                if let Some(schema) = &info.schema {
                    put_record(pool, id as u32, timestamp, schema);
                }
            }
        });

        // entries finished while inactive still close after their queued data
        let finished: Vec<(i32, i64)> = state
            .entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, info)| {
                info.buffered = false;
                info.finished_at
                    .take()
                    .map(|timestamp| (index as i32 + 1, timestamp))
            })
            .collect();
        for (id, timestamp) in finished {
            let payload = codec::encode_finish_payload(id);
            self.write_record(&mut state, 0, timestamp, &payload);
        }
        self.check_half_full(&mut state);
    }

    /// Deactivates the log. Entries keep being tracked and are replayed by
    /// the next [`start_file`](Self::start_file); the sink is left alone.
    pub fn stop(&self) {
        self.state.lock().active = false;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn drain_outgoing(&self) -> Vec<Buffer> {
        let mut state = self.state.lock();
        Self::drain_locked(&mut state)
    }

    pub(crate) fn drain_locked(state: &mut LogState) -> Vec<Buffer> {
        state.half_full_signaled = false;
        state.pool.drain_outgoing()
    }

    pub(crate) fn release_buffers(&self, bufs: Vec<Buffer>) {
        self.state.lock().pool.release(bufs);
    }

    fn write_record(&self, state: &mut LogState, entry: i32, timestamp: i64, payload: &[u8]) {
        let timestamp = self.resolve_timestamp(timestamp);
        put_record(&mut state.pool, entry as u32, timestamp, payload);
        self.check_half_full(state);
    }

    fn check_half_full(&self, state: &mut LogState) {
        if !state.half_full_signaled && state.pool.outgoing_len() >= MAX_BUFFER_COUNT / 2 {
            state.half_full_signaled = true;
            self.backend.buffer_half_full(state);
            self.wake.notify_all();
        }
    }

    /// Common path of every append: validates the entry, applies pause and
    /// backpressure, writes the header and lets `write` fill the payload.
    fn append_with(
        &self,
        entry: i32,
        timestamp: i64,
        payload_size: usize,
        write: impl FnOnce(&mut BufferPool),
    ) {
        if entry <= 0 {
            return;
        }
        let Ok(size) = u32::try_from(payload_size) else {
            warn!(entry, payload_size, "payload too large for a record, dropping");
            return;
        };

        let mut state = self.state.lock();
        if state.paused || !state.is_live(entry) {
            return;
        }
        if !state.active {
            if let Some(info) = state.entry_mut(entry) {
                info.buffered = true;
            }
        }
        if state.pool.outgoing_len() >= MAX_BUFFER_COUNT && self.backend.buffer_full(&mut state) {
            state.paused = true;
            return;
        }

        let timestamp = self.resolve_timestamp(timestamp);
        put_header(&mut state.pool, entry as u32, timestamp, size);
        write(&mut state.pool);
        self.check_half_full(&mut state);
    }

    pub fn append_raw(&self, entry: i32, data: &[u8], timestamp: i64) {
        self.append_with(entry, timestamp, data.len(), |pool| pool.append(data));
    }

    pub fn append_boolean(&self, entry: i32, value: bool, timestamp: i64) {
        self.append_raw(entry, &[u8::from(value)], timestamp);
    }

    pub fn append_integer(&self, entry: i32, value: i64, timestamp: i64) {
        self.append_raw(entry, &value.to_le_bytes(), timestamp);
    }

    pub fn append_float(&self, entry: i32, value: f32, timestamp: i64) {
        self.append_raw(entry, &value.to_le_bytes(), timestamp);
    }

    pub fn append_double(&self, entry: i32, value: f64, timestamp: i64) {
        self.append_raw(entry, &value.to_le_bytes(), timestamp);
    }

    pub fn append_string(&self, entry: i32, value: &str, timestamp: i64) {
        self.append_raw(entry, value.as_bytes(), timestamp);
    }

    pub fn append_boolean_array(&self, entry: i32, values: &[bool], timestamp: i64) {
        self.append_with(entry, timestamp, values.len(), |pool| {
            append_encoded(pool, values, |v| [u8::from(v)]);
        });
    }

    /// Boolean array given as integers, nonzero meaning true.
    pub fn append_boolean_array_from_ints(&self, entry: i32, values: &[i32], timestamp: i64) {
        self.append_with(entry, timestamp, values.len(), |pool| {
            append_encoded(pool, values, |v| [u8::from(v != 0)]);
        });
    }

    pub fn append_integer_array(&self, entry: i32, values: &[i64], timestamp: i64) {
        self.append_with(entry, timestamp, values.len() * 8, |pool| {
            append_encoded(pool, values, i64::to_le_bytes);
        });
    }

    pub fn append_float_array(&self, entry: i32, values: &[f32], timestamp: i64) {
        self.append_with(entry, timestamp, values.len() * 4, |pool| {
            append_encoded(pool, values, f32::to_le_bytes);
        });
    }

    pub fn append_double_array(&self, entry: i32, values: &[f64], timestamp: i64) {
        self.append_with(entry, timestamp, values.len() * 8, |pool| {
            append_encoded(pool, values, f64::to_le_bytes);
        });
    }

    pub fn append_string_array<S: AsRef<str>>(&self, entry: i32, values: &[S], timestamp: i64) {
        let size = codec::string_array_payload_size(values);
        self.append_with(entry, timestamp, size, |pool| {
            pool.append(&(values.len() as u32).to_le_bytes());
            for value in values {
                let value = value.as_ref().as_bytes();
                pool.append(&(value.len() as u32).to_le_bytes());
                pool.append(value);
            }
        });
    }
}

fn put_header(pool: &mut BufferPool, entry: u32, timestamp: u64, payload_size: u32) {
    let mut header = [0; RECORD_MAX_HEADER_SIZE];
    let len = codec::write_record_header(&mut header, entry, timestamp, payload_size);
    pool.reserve(len).copy_from_slice(&header[..len]);
}

fn put_record(pool: &mut BufferPool, entry: u32, timestamp: u64, payload: &[u8]) {
    put_header(pool, entry, timestamp, payload.len() as u32);
    pool.append(payload);
}

/// Encodes fixed-size elements through a small stack scratch buffer.
fn append_encoded<T: Copy, const N: usize>(
    pool: &mut BufferPool,
    values: &[T],
    encode: impl Fn(T) -> [u8; N],
) {
    const SCRATCH: usize = 256;
    let mut scratch = [0u8; SCRATCH];
    for chunk in values.chunks(SCRATCH / N) {
        let mut len = 0;
        for &value in chunk {
            scratch[len..len + N].copy_from_slice(&encode(value));
            len += N;
        }
        pool.append(&scratch[..len]);
    }
}
