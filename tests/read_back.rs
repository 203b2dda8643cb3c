use std::path::Path;

use wpidatalog::{
    entrytypes::{DoubleLogEntry, IntegerLogEntry, StringArrayLogEntry},
    structs::{StructArrayLogEntry, StructSerializable},
    DataLogReader, DataLogReaderThread, DataLogWriter, DataType, EntryCatalog, Record, RecordInfo,
    Value,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl StructSerializable for Point {
    const TYPE_NAME: &'static str = "Point";
    const SIZE: usize = 8;
    const SCHEMA: &'static str = "int32 x;int32 y";

    fn pack(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
    }

    fn unpack(data: &[u8]) -> Self {
        let mut x = [0; 4];
        let mut y = [0; 4];
        x.copy_from_slice(&data[..4]);
        y.copy_from_slice(&data[4..8]);
        Point {
            x: i32::from_le_bytes(x),
            y: i32::from_le_bytes(y),
        }
    }
}

fn write_log(path: &Path, voltage_type_metadata: &str) {
    let writer = DataLogWriter::create(path).unwrap();

    let voltage =
        DoubleLogEntry::with_metadata(&writer, "/robot/voltage", voltage_type_metadata, 1);
    let count = IntegerLogEntry::new(&writer, "/robot/count", 1);
    let names = StringArrayLogEntry::new(&writer, "/robot/names", 1);
    let points = StructArrayLogEntry::<Point>::new(&writer, "/robot/points", 1);

    for i in 0..10 {
        let t = 10 + i64::from(i);
        voltage.update(&(12.0 - f64::from(i) * 0.1), t);
        // every other value repeats and is skipped
        count.update(&i64::from(i / 2), t);
        points.update(&[Point { x: i, y: -i }], t);
    }
    names.update_strs(&["left", "right"], 30);
    count.finish(40);
}

#[test]
fn file_round_trip_through_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("robot.wpilog");
    write_log(&path, "{\"unit\":\"V\"}");

    let mut index = DataLogReaderThread::new(DataLogReader::open(&path).unwrap()).unwrap();
    index.wait();
    assert!(index.is_done());

    let voltage = index.entry("/robot/voltage").unwrap();
    assert_eq!(voltage.data_type, DataType::Double);
    assert_eq!(voltage.metadata, "{\"unit\":\"V\"}");
    assert_eq!(voltage.ranges.len(), 1);
    let values: Vec<Value> = voltage
        .ranges
        .iter()
        .flat_map(|&range| index.records_in(range))
        .filter(|r| r.entry() == voltage.entry && !r.is_control())
        .filter_map(|r| r.value(&voltage.data_type))
        .collect();
    assert_eq!(values.len(), 10);
    assert_eq!(values[0], Value::Double(12.0));

    let count = index.entry("/robot/count").unwrap();
    let counts: Vec<i64> = count
        .ranges
        .iter()
        .flat_map(|&range| index.records_in(range))
        .filter(|r| r.entry() == count.entry && !r.is_control())
        .filter_map(|r| r.get_integer())
        .collect();
    assert_eq!(counts, vec![0, 1, 2, 3, 4]);

    let points = index.entry("/robot/points").unwrap();
    assert_eq!(points.data_type, DataType::StructArray("Point".into()));
    index.with_schemas(|schemas| {
        assert_eq!(schemas.struct_schema("Point"), Some(&b"int32 x;int32 y"[..]));
    });
}

#[test]
fn records_convert_to_owned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owned.wpilog");
    write_log(&path, "");

    let reader = DataLogReader::open(&path).unwrap();
    let records: Vec<Record> = reader
        .records()
        .map(|r| Record::try_from(r).unwrap())
        .collect();

    let finish = records
        .iter()
        .find(|r| matches!(r.info, RecordInfo::Control(wpidatalog::ControlData::Finish)))
        .unwrap();
    assert_eq!(finish.timestamp, 40);

    let names = reader
        .records()
        .find(|r| r.timestamp() == 30 && !r.is_control())
        .unwrap();
    assert_eq!(names.get_string_array(), Some(vec!["left", "right"]));
}

#[test]
fn catalog_merges_files() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.wpilog");
    let second = dir.path().join("second.wpilog");
    write_log(&first, "{\"unit\":\"V\"}");
    write_log(&second, "{\"unit\":\"mV\"}");

    let mut catalog = EntryCatalog::new();
    let a = catalog.open(&first).unwrap();
    let b = catalog.open(&second).unwrap();
    catalog.wait();

    let voltage = catalog.entry("/robot/voltage").unwrap();
    assert_eq!(voltage.files, vec![a, b]);
    assert!(voltage.metadata_conflict);
    assert!(!voltage.type_conflict);

    catalog.close(a);
    let voltage = catalog.entry("/robot/voltage").unwrap();
    assert_eq!(voltage.files, vec![b]);
    assert_eq!(voltage.metadata, "{\"unit\":\"mV\"}");
    assert!(!voltage.metadata_conflict);
}
