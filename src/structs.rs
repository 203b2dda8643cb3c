//! Fixed-size struct values logged with a self-describing schema.
//!
//! A struct type registers its schema text once per log as the entry
//! `/.schema/struct:<name>` (type `structschema`); entries holding values
//! use the type `struct:<name>` or `struct:<name>[]`.

use std::marker::PhantomData;

use parking_lot::Mutex;

use crate::{
    datatype::{STRUCT_PREFIX, STRUCT_SCHEMA_TYPE},
    log::DataLog,
};

pub trait StructSerializable: Sized {
    /// Name without the `struct:` prefix.
    const TYPE_NAME: &'static str;
    /// Packed size in bytes.
    const SIZE: usize;
    const SCHEMA: &'static str;

    /// Preconditions: `out.len() == Self::SIZE`
    fn pack(&self, out: &mut [u8]);

    /// Preconditions: `data.len() == Self::SIZE`
    fn unpack(data: &[u8]) -> Self;

    /// Calls `f(type_string, schema)` for every struct type this one
    /// contains, innermost first.
    fn for_each_nested(_f: &mut dyn FnMut(&str, &str)) {}

    #[must_use]
    fn type_string() -> String {
        format!("{STRUCT_PREFIX}{}", Self::TYPE_NAME)
    }
}

impl DataLog {
    /// Registers the schema of `T` and of every struct nested in it.
    /// Registering an already known schema does nothing.
    pub fn add_struct_schema<T: StructSerializable>(&self, timestamp: i64) {
        let type_string = T::type_string();
        if self.has_schema(&type_string) {
            return;
        }
        T::for_each_nested(&mut |nested, schema| {
            self.add_schema_str(nested, STRUCT_SCHEMA_TYPE, schema, timestamp);
        });
        self.add_schema_str(&type_string, STRUCT_SCHEMA_TYPE, T::SCHEMA, timestamp);
    }
}

fn pack_one<T: StructSerializable>(value: &T) -> Vec<u8> {
    let mut buf = vec![0; T::SIZE];
    value.pack(&mut buf);
    buf
}

fn pack_all<T: StructSerializable>(values: &[T]) -> Vec<u8> {
    let mut buf = vec![0; T::SIZE * values.len()];
    if T::SIZE > 0 {
        for (value, out) in values.iter().zip(buf.chunks_exact_mut(T::SIZE)) {
            value.pack(out);
        }
    }
    buf
}

/// An entry holding one `T` per record. Finishes the entry when dropped.
pub struct StructLogEntry<'a, T: StructSerializable> {
    log: &'a DataLog,
    entry: i32,
    last: Mutex<Option<Vec<u8>>>,
    _marker: PhantomData<fn(&T)>,
}

impl<'a, T: StructSerializable> StructLogEntry<'a, T> {
    pub fn new(log: &'a DataLog, name: &str, timestamp: i64) -> Self {
        Self::with_metadata(log, name, "", timestamp)
    }

    pub fn with_metadata(log: &'a DataLog, name: &str, metadata: &str, timestamp: i64) -> Self {
        log.add_struct_schema::<T>(timestamp);
        StructLogEntry {
            log,
            entry: log.start(name, &T::type_string(), metadata, timestamp),
            last: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn entry(&self) -> i32 {
        self.entry
    }

    pub fn append(&self, value: &T, timestamp: i64) {
        self.log.append_raw(self.entry, &pack_one(value), timestamp);
    }

    /// Appends only if the packed bytes differ from the last update.
    pub fn update(&self, value: &T, timestamp: i64) {
        let packed = pack_one(value);
        let mut last = self.last.lock();
        if last.as_deref() == Some(&packed[..]) {
            return;
        }
        self.log.append_raw(self.entry, &packed, timestamp);
        *last = Some(packed);
    }

    #[must_use]
    pub fn has_last_value(&self) -> bool {
        self.last.lock().is_some()
    }

    #[must_use]
    pub fn last_value(&self) -> Option<T> {
        self.last.lock().as_deref().map(T::unpack)
    }

    pub fn set_metadata(&self, metadata: &str, timestamp: i64) {
        self.log.set_metadata(self.entry, metadata, timestamp);
    }

    pub fn finish(mut self, timestamp: i64) {
        self.log.finish(self.entry, timestamp);
        self.entry = 0;
    }
}

impl<T: StructSerializable> Drop for StructLogEntry<'_, T> {
    fn drop(&mut self) {
        self.log.finish(self.entry, 0);
    }
}

/// An entry holding a packed array of `T` per record.
pub struct StructArrayLogEntry<'a, T: StructSerializable> {
    log: &'a DataLog,
    entry: i32,
    last: Mutex<Option<Vec<u8>>>,
    _marker: PhantomData<fn(&T)>,
}

impl<'a, T: StructSerializable> StructArrayLogEntry<'a, T> {
    pub fn new(log: &'a DataLog, name: &str, timestamp: i64) -> Self {
        Self::with_metadata(log, name, "", timestamp)
    }

    pub fn with_metadata(log: &'a DataLog, name: &str, metadata: &str, timestamp: i64) -> Self {
        log.add_struct_schema::<T>(timestamp);
        StructArrayLogEntry {
            log,
            entry: log.start(name, &format!("{}[]", T::type_string()), metadata, timestamp),
            last: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn entry(&self) -> i32 {
        self.entry
    }

    pub fn append(&self, values: &[T], timestamp: i64) {
        self.log.append_raw(self.entry, &pack_all(values), timestamp);
    }

    pub fn update(&self, values: &[T], timestamp: i64) {
        let packed = pack_all(values);
        let mut last = self.last.lock();
        if last.as_deref() == Some(&packed[..]) {
            return;
        }
        self.log.append_raw(self.entry, &packed, timestamp);
        *last = Some(packed);
    }

    #[must_use]
    pub fn has_last_value(&self) -> bool {
        self.last.lock().is_some()
    }

    #[must_use]
    pub fn last_value(&self) -> Option<Vec<T>> {
        let last = self.last.lock();
        let packed = last.as_deref()?;
        if T::SIZE == 0 {
            return Some(Vec::new());
        }
        Some(packed.chunks_exact(T::SIZE).map(T::unpack).collect())
    }

    pub fn set_metadata(&self, metadata: &str, timestamp: i64) {
        self.log.set_metadata(self.entry, metadata, timestamp);
    }

    pub fn finish(mut self, timestamp: i64) {
        self.log.finish(self.entry, timestamp);
        self.entry = 0;
    }
}

impl<T: StructSerializable> Drop for StructArrayLogEntry<'_, T> {
    fn drop(&mut self) {
        self.log.finish(self.entry, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reader::DataLogReader,
        writer::tests::{flushed, test_writer},
    };

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct ThingA {
        x: u8,
    }

    impl StructSerializable for ThingA {
        const TYPE_NAME: &'static str = "ThingA";
        const SIZE: usize = 1;
        const SCHEMA: &'static str = "uint8 value";

        fn pack(&self, out: &mut [u8]) {
            out[0] = self.x;
        }

        fn unpack(data: &[u8]) -> Self {
            ThingA { x: data[0] }
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pair {
        a: ThingA,
        b: i16,
    }

    impl StructSerializable for Pair {
        const TYPE_NAME: &'static str = "Pair";
        const SIZE: usize = 3;
        const SCHEMA: &'static str = "ThingA a;int16 b";

        fn pack(&self, out: &mut [u8]) {
            self.a.pack(&mut out[..1]);
            out[1..3].copy_from_slice(&self.b.to_le_bytes());
        }

        fn unpack(data: &[u8]) -> Self {
            Pair {
                a: ThingA::unpack(&data[..1]),
                b: i16::from_le_bytes([data[1], data[2]]),
            }
        }

        fn for_each_nested(f: &mut dyn FnMut(&str, &str)) {
            ThingA::for_each_nested(f);
            f(&ThingA::type_string(), ThingA::SCHEMA);
        }
    }

    #[test]
    fn struct_update() {
        let writer = test_writer();
        let entry = StructLogEntry::<ThingA>::new(&writer, "a", 5);
        assert!(!entry.has_last_value());
        entry.update(&ThingA::default(), 7);
        assert_eq!(flushed(&writer).len(), 122);
        assert_eq!(entry.last_value(), Some(ThingA::default()));
        entry.update(&ThingA::default(), 8);
        assert_eq!(flushed(&writer).len(), 122);
        entry.update(&ThingA { x: 1 }, 9);
        assert_eq!(flushed(&writer).len(), 127);
        assert_eq!(entry.last_value(), Some(ThingA { x: 1 }));
    }

    #[test]
    fn struct_array_update() {
        let writer = test_writer();
        let entry = StructArrayLogEntry::<ThingA>::new(&writer, "a", 5);
        entry.update(&[ThingA::default(), ThingA::default()], 7);
        assert_eq!(flushed(&writer).len(), 125);
        entry.update(&[ThingA::default(), ThingA::default()], 8);
        assert_eq!(flushed(&writer).len(), 125);
        entry.update(&[ThingA::default(), ThingA { x: 1 }], 9);
        assert_eq!(flushed(&writer).len(), 131);
        entry.update(&[], 10);
        assert_eq!(flushed(&writer).len(), 135);
        assert_eq!(entry.last_value(), Some(vec![]));
    }

    #[test]
    fn schema_written_once_per_type() {
        let writer = test_writer();
        let a = StructLogEntry::<ThingA>::new(&writer, "a", 5);
        let b = StructArrayLogEntry::<ThingA>::new(&writer, "b", 5);
        a.append(&ThingA { x: 3 }, 6);
        b.append(&[ThingA { x: 4 }], 6);

        let reader = DataLogReader::new(flushed(&writer));
        let starts: Vec<_> = reader
            .records()
            .filter_map(|r| r.start_data().map(|s| (s.name, s.r#type)))
            .collect();
        assert_eq!(
            starts,
            vec![
                ("/.schema/struct:ThingA", "structschema"),
                ("a", "struct:ThingA"),
                ("b", "struct:ThingA[]"),
            ]
        );
    }

    #[test]
    fn nested_schemas_come_first() {
        let writer = test_writer();
        let entry = StructLogEntry::<Pair>::new(&writer, "p", 5);
        let value = Pair {
            a: ThingA { x: 9 },
            b: -2,
        };
        entry.update(&value, 6);
        assert_eq!(entry.last_value(), Some(value));
        assert!(writer.has_schema("struct:ThingA"));
        assert!(writer.has_schema("struct:Pair"));

        let reader = DataLogReader::new(flushed(&writer));
        let schemas: Vec<_> = reader
            .records()
            .filter_map(|r| r.start_data())
            .filter(|s| s.r#type == "structschema")
            .map(|s| s.name)
            .collect();
        assert_eq!(schemas, vec!["/.schema/struct:ThingA", "/.schema/struct:Pair"]);

        let last = reader.records().last().unwrap();
        assert_eq!(last.raw(), &[9, 0xfe, 0xff]);
    }
}
