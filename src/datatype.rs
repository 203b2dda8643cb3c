//! Entry type strings parsed into a closed set, and payloads decoded by type.

use std::fmt;

use crate::reader::DataLogRecord;

pub const STRUCT_PREFIX: &str = "struct:";
pub const PROTO_PREFIX: &str = "proto:";
/// Type of the entries that carry struct schema text.
pub const STRUCT_SCHEMA_TYPE: &str = "structschema";
/// Type of the entries that carry serialized protobuf file descriptors.
pub const PROTO_SCHEMA_TYPE: &str = "proto:FileDescriptorProto";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Raw,
    Boolean,
    Integer,
    Float,
    Double,
    String,
    Json,
    Msgpack,
    BooleanArray,
    IntegerArray,
    FloatArray,
    DoubleArray,
    StringArray,
    StructSchema,
    /// `struct:<name>`
    Struct(String),
    /// `struct:<name>[]`
    StructArray(String),
    /// `proto:<name>`
    Protobuf(String),
    /// Anything else; decoded as raw bytes.
    Other(String),
}

impl DataType {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "raw" => DataType::Raw,
            "boolean" => DataType::Boolean,
            "int64" => DataType::Integer,
            "float" => DataType::Float,
            "double" => DataType::Double,
            "string" => DataType::String,
            "json" => DataType::Json,
            "msgpack" => DataType::Msgpack,
            "boolean[]" => DataType::BooleanArray,
            "int64[]" => DataType::IntegerArray,
            "float[]" => DataType::FloatArray,
            "double[]" => DataType::DoubleArray,
            "string[]" => DataType::StringArray,
            STRUCT_SCHEMA_TYPE => DataType::StructSchema,
            _ => {
                if let Some(name) = s.strip_prefix(STRUCT_PREFIX) {
                    match name.strip_suffix("[]") {
                        Some(name) => DataType::StructArray(name.to_owned()),
                        None => DataType::Struct(name.to_owned()),
                    }
                } else if let Some(name) = s.strip_prefix(PROTO_PREFIX) {
                    DataType::Protobuf(name.to_owned())
                } else {
                    DataType::Other(s.to_owned())
                }
            }
        }
    }

    /// Entries of this type carry schemas for other entries.
    #[must_use]
    pub fn is_schema(&self) -> bool {
        match self {
            DataType::StructSchema => true,
            DataType::Protobuf(name) => name == "FileDescriptorProto",
            _ => false,
        }
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            DataType::BooleanArray
                | DataType::IntegerArray
                | DataType::FloatArray
                | DataType::DoubleArray
                | DataType::StringArray
                | DataType::StructArray(_)
        )
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        DataType::parse(s)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Raw => "raw",
            DataType::Boolean => "boolean",
            DataType::Integer => "int64",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Json => "json",
            DataType::Msgpack => "msgpack",
            DataType::BooleanArray => "boolean[]",
            DataType::IntegerArray => "int64[]",
            DataType::FloatArray => "float[]",
            DataType::DoubleArray => "double[]",
            DataType::StringArray => "string[]",
            DataType::StructSchema => STRUCT_SCHEMA_TYPE,
            DataType::Struct(name) => return write!(f, "{STRUCT_PREFIX}{name}"),
            DataType::StructArray(name) => return write!(f, "{STRUCT_PREFIX}{name}[]"),
            DataType::Protobuf(name) => return write!(f, "{PROTO_PREFIX}{name}"),
            DataType::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// A data record's payload decoded according to its entry's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Raw(&'a [u8]),
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    String(&'a str),
    BooleanArray(Vec<bool>),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<&'a str>),
}

impl<'a> DataLogRecord<'a> {
    /// Decodes the payload as `data_type`. Types without a fixed layout here
    /// (structs, protobuf, msgpack) come back as [`Value::Raw`].
    #[must_use]
    pub fn value(&self, data_type: &DataType) -> Option<Value<'a>> {
        Some(match data_type {
            DataType::Boolean => Value::Boolean(self.get_boolean()?),
            DataType::Integer => Value::Integer(self.get_integer()?),
            DataType::Float => Value::Float(self.get_float()?),
            DataType::Double => Value::Double(self.get_double()?),
            DataType::String | DataType::Json => Value::String(self.get_string()?),
            DataType::BooleanArray => Value::BooleanArray(self.get_boolean_array()?),
            DataType::IntegerArray => Value::IntegerArray(self.get_integer_array()?),
            DataType::FloatArray => Value::FloatArray(self.get_float_array()?),
            DataType::DoubleArray => Value::DoubleArray(self.get_double_array()?),
            DataType::StringArray => Value::StringArray(self.get_string_array()?),
            DataType::Raw
            | DataType::Msgpack
            | DataType::StructSchema
            | DataType::Struct(_)
            | DataType::StructArray(_)
            | DataType::Protobuf(_)
            | DataType::Other(_) => Value::Raw(self.raw()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reader::DataLogReader,
        writer::tests::{flushed, test_writer},
    };

    #[test]
    fn type_strings_round_trip() {
        for s in [
            "raw",
            "boolean",
            "int64",
            "float",
            "double",
            "string",
            "json",
            "msgpack",
            "boolean[]",
            "int64[]",
            "float[]",
            "double[]",
            "string[]",
            "structschema",
            "struct:Pose2d",
            "struct:Pose2d[]",
            "proto:Pose3d",
            "something-else",
        ] {
            assert_eq!(DataType::parse(s).to_string(), s);
        }
    }

    #[test]
    fn struct_types_keep_names() {
        assert_eq!(
            DataType::parse("struct:ThingA[]"),
            DataType::StructArray("ThingA".into())
        );
        assert_eq!(DataType::parse("struct:ThingA"), DataType::Struct("ThingA".into()));
        assert!(DataType::parse("struct:ThingA[]").is_array());
        assert!(!DataType::parse("struct:ThingA").is_array());
    }

    #[test]
    fn schema_types() {
        assert!(DataType::parse("structschema").is_schema());
        assert!(DataType::parse("proto:FileDescriptorProto").is_schema());
        assert!(!DataType::parse("proto:Pose3d").is_schema());
        assert!(!DataType::parse("string").is_schema());
    }

    #[test]
    fn values_decode_by_type() {
        let writer = test_writer();
        let d = writer.start("d", "double", "", 1);
        let s = writer.start("s", "json", "", 1);
        let a = writer.start("a", "float[]", "", 1);
        writer.append_double(d, 2.5, 2);
        writer.append_string(s, "{}", 2);
        writer.append_float_array(a, &[1.0, -1.0], 2);

        let reader = DataLogReader::new(flushed(&writer));
        let values: Vec<_> = reader
            .records()
            .filter(|r| !r.is_control())
            .collect();

        assert_eq!(values[0].value(&DataType::Double), Some(Value::Double(2.5)));
        assert_eq!(values[1].value(&DataType::Json), Some(Value::String("{}")));
        assert_eq!(
            values[2].value(&DataType::FloatArray),
            Some(Value::FloatArray(vec![1.0, -1.0]))
        );
        assert_eq!(values[0].value(&DataType::Boolean), None);
        assert_eq!(
            values[1].value(&DataType::Struct("X".into())),
            Some(Value::Raw(b"{}"))
        );
    }
}
