use anyhow::Result;
use parking_lot::Mutex;
use std::{
    fs::File,
    io::Write,
    ops::Deref,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::error;

use crate::{
    buffer::Buffer,
    clock::{MonotonicClock, TimeProvider},
    log::{Backend, DataLog, LogState},
};

struct SinkBackend<W> {
    sink: Mutex<W>,
    failed: AtomicBool,
}

impl<W: Write> SinkBackend<W> {
    fn write_out(&self, bufs: &[Buffer]) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }

        let mut sink = self.sink.lock();
        let result = bufs
            .iter()
            .try_for_each(|buf| sink.write_all(buf.data()))
            .and_then(|()| sink.flush());
        if let Err(err) = result {
            error!(%err, "error writing to data log sink, no further data will be written");
            self.failed.store(true, Ordering::Relaxed);
        }
    }
}

impl<W: Write + Send> Backend for SinkBackend<W> {
    fn buffer_full(&self, state: &mut LogState) -> bool {
        let bufs = DataLog::drain_locked(state);
        if state.active {
            self.write_out(&bufs);
        }
        state.pool.release(bufs);
        false
    }
}

/// A [`DataLog`] written synchronously to any [`Write`] sink.
///
/// Nothing reaches the sink until [`flush`](Self::flush) is called (or the
/// queue fills up, or the writer is dropped). Unlike
/// [`DataLogBackgroundWriter`](crate::DataLogBackgroundWriter) this never
/// pauses the log under backpressure.
pub struct DataLogWriter<W: Write + Send + 'static> {
    log: DataLog,
    backend: Arc<SinkBackend<W>>,
}

impl DataLogWriter<File> {
    /// Creates (or truncates) `path` and logs to it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write + Send + 'static> DataLogWriter<W> {
    pub fn new(sink: W) -> Self {
        Self::with_clock(sink, MonotonicClock::new(), "")
    }

    pub fn with_extra_header(sink: W, extra_header: &str) -> Self {
        Self::with_clock(sink, MonotonicClock::new(), extra_header)
    }

    pub fn with_clock(
        sink: W,
        clock: impl TimeProvider + Send + Sync + 'static,
        extra_header: &str,
    ) -> Self {
        let backend = Arc::new(SinkBackend {
            sink: Mutex::new(sink),
            failed: AtomicBool::new(false),
        });
        let log = DataLog::new(backend.clone(), Arc::new(clock), extra_header);
        log.start_file();
        DataLogWriter { log, backend }
    }

    /// Writes everything queued so far to the sink. After a
    /// [`stop`](Self::stop) queued data is discarded instead.
    pub fn flush(&self) {
        // held across the write so concurrent flushes cannot reorder blocks
        let mut state = self.log.lock();
        let bufs = DataLog::drain_locked(&mut state);
        if state.active {
            self.backend.write_out(&bufs);
        }
        state.pool.release(bufs);
    }

    /// Flushes and deactivates the log; later control records and appends
    /// are not written.
    pub fn stop(&self) {
        self.flush();
        self.log.stop();
    }

    /// Runs `f` with exclusive access to the sink.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.backend.sink.lock())
    }
}

impl<W: Write + Send + 'static> Deref for DataLogWriter<W> {
    type Target = DataLog;

    fn deref(&self) -> &DataLog {
        &self.log
    }
}

impl<W: Write + Send + 'static> Drop for DataLogWriter<W> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        buffer::{BLOCK_SIZE, MAX_BUFFER_COUNT},
        log::tests::FixedClock,
        reader::DataLogReader,
    };
    use std::io;

    pub(crate) fn test_writer() -> DataLogWriter<Vec<u8>> {
        DataLogWriter::with_clock(Vec::new(), FixedClock(1000), "")
    }

    pub(crate) fn flushed(writer: &DataLogWriter<Vec<u8>>) -> Vec<u8> {
        writer.flush();
        writer.with_sink(|data| data.clone())
    }

    #[test]
    fn simple_int() {
        let writer = test_writer();
        let entry = writer.start("test", "int64", "", 1);
        assert_eq!(entry, 1);
        writer.append_integer(entry, 1, 2);

        let data = flushed(&writer);
        assert_eq!(data.len(), 54);

        let reader = DataLogReader::new(data);
        assert!(reader.is_valid());
        let records: Vec<_> = reader.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp(), 1);
        assert_eq!(records[1].entry(), entry);
        assert_eq!(records[1].timestamp(), 2);
        assert_eq!(records[1].get_integer(), Some(1));
    }

    #[test]
    fn extra_header_round_trips() {
        let writer = DataLogWriter::with_clock(Vec::new(), FixedClock(1), "robot 1234");
        let data = flushed(&writer);
        assert_eq!(data.len(), 12 + 10);
        assert_eq!(&data[0..6], b"WPILOG");
        assert_eq!(&data[6..8], &[0x00, 0x01]);
        assert_eq!(&data[8..12], &10u32.to_le_bytes());
        assert_eq!(&data[12..], b"robot 1234");

        let reader = DataLogReader::new(data);
        assert_eq!(reader.extra_header(), "robot 1234");
        assert_eq!(reader.version(), 0x0100);
    }

    #[test]
    fn nothing_written_until_flush() {
        let writer = test_writer();
        let entry = writer.start("a", "double", "", 5);
        writer.append_double(entry, 1.5, 7);
        assert!(writer.with_sink(|data| data.is_empty()));
        assert_eq!(flushed(&writer).len(), 52);
    }

    #[test]
    fn drop_flushes() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);

        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let shared = Shared::default();
        {
            let writer = DataLogWriter::with_clock(shared.clone(), FixedClock(1), "");
            let entry = writer.start("a", "boolean", "", 5);
            writer.append_boolean(entry, true, 7);
        }
        assert_eq!(shared.0.lock().len(), 46);
    }

    #[test]
    fn full_queue_writes_through_instead_of_pausing() {
        let writer = test_writer();
        let entry = writer.start("big", "raw", "", 1);
        let chunk = vec![7u8; BLOCK_SIZE];
        let count = MAX_BUFFER_COUNT + 8;
        for _ in 0..count {
            writer.append_raw(entry, &chunk, 2);
        }
        assert!(!writer.is_paused());
        assert!(writer.with_sink(|data| !data.is_empty()));

        let reader = DataLogReader::new(flushed(&writer));
        let appended = reader.records().filter(|r| r.entry() == entry).count();
        assert_eq!(appended, count);
    }

    #[test]
    fn stop_discards_later_records() {
        let writer = test_writer();
        let entry = writer.start("a", "int64", "", 5);
        writer.stop();
        let len = writer.with_sink(|data| data.len());
        writer.append_integer(entry, 1, 7);
        writer.finish(entry, 8);
        assert_eq!(flushed(&writer).len(), len);
    }

    #[test]
    fn failing_sink_is_abandoned() {
        struct Broken;

        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let writer = DataLogWriter::with_clock(Broken, FixedClock(1), "");
        let entry = writer.start("a", "int64", "", 5);
        writer.flush();
        writer.append_integer(entry, 1, 7);
        writer.flush();
        assert!(writer.backend.failed.load(Ordering::Relaxed));
    }
}
