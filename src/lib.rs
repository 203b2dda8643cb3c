#![warn(clippy::pedantic, clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! Append-only, self-describing binary data logs ("WPILOG").
//!
//! Producers write through a [`DataLog`] owned by either a
//! [`DataLogWriter`] (explicit flushes into any [`std::io::Write`]) or a
//! [`DataLogBackgroundWriter`] (a dedicated thread that drains buffers into
//! rotating files). Consumers read with a [`DataLogReader`] and can index a
//! whole file on a background thread with a [`DataLogReaderThread`].

pub mod background;
pub mod buffer;
pub mod catalog;
pub mod clock;
pub mod codec;
pub mod datatype;
pub mod entrytypes;
pub mod index;
pub mod log;
pub mod reader;
pub mod structs;
pub mod writer;

pub use background::{BackgroundWriterConfig, ConfigError, DataLogBackgroundWriter};
pub use catalog::{CatalogEntry, EntryCatalog, FileId};
pub use clock::{MonotonicClock, TimeProvider};
pub use datatype::{DataType, Value};
pub use index::{DataLogReaderThread, EntryData, IndexEvent, RecordRange, SchemaRegistry};
pub use log::DataLog;
pub use reader::{DataLogReader, DataLogRecord, RecordIter, RecordPosition};
pub use writer::DataLogWriter;

pub(crate) static HEADER_STRING: &[u8; 6] = b"WPILOG";
pub(crate) static HEADER_VERSION: u16 = 0x0100;

/// A fully decoded, owned record.
///
/// For control records `entry` is the entry the control record refers to,
/// not the wire entry id (which is always 0).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub entry: i32,
    pub timestamp: i64,
    pub info: RecordInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordInfo {
    Control(ControlData),
    Data(Box<[u8]>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlData {
    Start {
        name: Box<str>,
        r#type: Box<str>,
        metadata: Box<str>,
    },
    Finish,
    SetMetadata(Box<str>),
}
