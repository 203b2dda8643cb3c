use parking_lot::Mutex;

use crate::log::DataLog;

/// What a [`LogEntry`] carries: its type string, how a value is appended,
/// and what is remembered for [`LogEntry::update`].
pub trait EntryKind {
    const TYPE: &'static str;
    type Value: ?Sized;
    type Stored: Clone;

    fn append(log: &DataLog, entry: i32, value: &Self::Value, timestamp: i64);
    fn store(value: &Self::Value) -> Self::Stored;
    fn matches(last: &Self::Stored, value: &Self::Value) -> bool;
}

pub mod kinds {
    use super::EntryKind;
    use crate::log::DataLog;

    macro_rules! scalar_kind {
        ($kind:ident, $type:literal, $value:ty, $append:ident) => {
            #[derive(Debug)]
            pub enum $kind {}

            impl EntryKind for $kind {
                const TYPE: &'static str = $type;
                type Value = $value;
                type Stored = $value;

                fn append(log: &DataLog, entry: i32, value: &$value, timestamp: i64) {
                    log.$append(entry, *value, timestamp);
                }

                fn store(value: &$value) -> $value {
                    *value
                }

                fn matches(last: &$value, value: &$value) -> bool {
                    last == value
                }
            }
        };
    }

    macro_rules! slice_kind {
        ($kind:ident, $type:literal, $value:ty, $stored:ty, $append:ident) => {
            #[derive(Debug)]
            pub enum $kind {}

            impl EntryKind for $kind {
                const TYPE: &'static str = $type;
                type Value = $value;
                type Stored = $stored;

                fn append(log: &DataLog, entry: i32, value: &$value, timestamp: i64) {
                    log.$append(entry, value, timestamp);
                }

                fn store(value: &$value) -> $stored {
                    value.to_owned()
                }

                fn matches(last: &$stored, value: &$value) -> bool {
                    **last == *value
                }
            }
        };
    }

    slice_kind!(Raw, "raw", [u8], Vec<u8>, append_raw);
    scalar_kind!(Boolean, "boolean", bool, append_boolean);
    scalar_kind!(Integer, "int64", i64, append_integer);
    scalar_kind!(Float, "float", f32, append_float);
    scalar_kind!(Double, "double", f64, append_double);
    slice_kind!(Str, "string", str, String, append_string);
    slice_kind!(BooleanArray, "boolean[]", [bool], Vec<bool>, append_boolean_array);
    slice_kind!(IntegerArray, "int64[]", [i64], Vec<i64>, append_integer_array);
    slice_kind!(FloatArray, "float[]", [f32], Vec<f32>, append_float_array);
    slice_kind!(DoubleArray, "double[]", [f64], Vec<f64>, append_double_array);
    slice_kind!(StrArray, "string[]", [String], Vec<String>, append_string_array);
}

/// A started entry of a fixed type. Finishes the entry when dropped.
///
/// [`update`](Self::update) only appends when the value differs from the
/// last one passed to `update`; [`append`](Self::append) always appends and
/// leaves the remembered value alone.
pub struct LogEntry<'a, K: EntryKind> {
    log: &'a DataLog,
    entry: i32,
    last: Mutex<Option<K::Stored>>,
}

pub type RawLogEntry<'a> = LogEntry<'a, kinds::Raw>;
pub type BooleanLogEntry<'a> = LogEntry<'a, kinds::Boolean>;
pub type IntegerLogEntry<'a> = LogEntry<'a, kinds::Integer>;
pub type FloatLogEntry<'a> = LogEntry<'a, kinds::Float>;
pub type DoubleLogEntry<'a> = LogEntry<'a, kinds::Double>;
pub type StringLogEntry<'a> = LogEntry<'a, kinds::Str>;
pub type BooleanArrayLogEntry<'a> = LogEntry<'a, kinds::BooleanArray>;
pub type IntegerArrayLogEntry<'a> = LogEntry<'a, kinds::IntegerArray>;
pub type FloatArrayLogEntry<'a> = LogEntry<'a, kinds::FloatArray>;
pub type DoubleArrayLogEntry<'a> = LogEntry<'a, kinds::DoubleArray>;
pub type StringArrayLogEntry<'a> = LogEntry<'a, kinds::StrArray>;

impl<'a, K: EntryKind> LogEntry<'a, K> {
    pub fn new(log: &'a DataLog, name: &str, timestamp: i64) -> Self {
        Self::with_metadata(log, name, "", timestamp)
    }

    pub fn with_metadata(log: &'a DataLog, name: &str, metadata: &str, timestamp: i64) -> Self {
        LogEntry {
            log,
            entry: log.start(name, K::TYPE, metadata, timestamp),
            last: Mutex::new(None),
        }
    }

    /// The entry id; 0 if the start was rejected.
    #[must_use]
    pub fn entry(&self) -> i32 {
        self.entry
    }

    pub fn append(&self, value: &K::Value, timestamp: i64) {
        K::append(self.log, self.entry, value, timestamp);
    }

    pub fn update(&self, value: &K::Value, timestamp: i64) {
        let mut last = self.last.lock();
        if last.as_ref().is_some_and(|last| K::matches(last, value)) {
            return;
        }
        *last = Some(K::store(value));
        K::append(self.log, self.entry, value, timestamp);
    }

    #[must_use]
    pub fn has_last_value(&self) -> bool {
        self.last.lock().is_some()
    }

    #[must_use]
    pub fn last_value(&self) -> Option<K::Stored> {
        self.last.lock().clone()
    }

    pub fn set_metadata(&self, metadata: &str, timestamp: i64) {
        self.log.set_metadata(self.entry, metadata, timestamp);
    }

    pub fn finish(mut self, timestamp: i64) {
        self.log.finish(self.entry, timestamp);
        self.entry = 0;
    }
}

impl<K: EntryKind> Drop for LogEntry<'_, K> {
    fn drop(&mut self) {
        self.log.finish(self.entry, 0);
    }
}

impl LogEntry<'_, kinds::BooleanArray> {
    /// Appends integers as booleans, nonzero meaning true.
    pub fn append_ints(&self, values: &[i32], timestamp: i64) {
        self.log
            .append_boolean_array_from_ints(self.entry, values, timestamp);
    }

    pub fn update_ints(&self, values: &[i32], timestamp: i64) {
        let mut last = self.last.lock();
        let unchanged = last.as_ref().is_some_and(|last| {
            last.len() == values.len() && last.iter().zip(values).all(|(&b, &v)| b == (v != 0))
        });
        if unchanged {
            return;
        }
        *last = Some(values.iter().map(|&v| v != 0).collect());
        self.append_ints(values, timestamp);
    }
}

impl LogEntry<'_, kinds::StrArray> {
    pub fn append_strs<S: AsRef<str>>(&self, values: &[S], timestamp: i64) {
        self.log.append_string_array(self.entry, values, timestamp);
    }

    pub fn update_strs<S: AsRef<str>>(&self, values: &[S], timestamp: i64) {
        let mut last = self.last.lock();
        let unchanged = last.as_ref().is_some_and(|last| {
            last.len() == values.len() && last.iter().zip(values).all(|(l, v)| l == v.as_ref())
        });
        if unchanged {
            return;
        }
        *last = Some(values.iter().map(|v| v.as_ref().to_owned()).collect());
        self.append_strs(values, timestamp);
    }
}
