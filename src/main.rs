use anyhow::{bail, Context, Result};
use std::{collections::HashMap, env};
use tracing_subscriber::EnvFilter;
use wpidatalog::{
    entrytypes::{
        BooleanArrayLogEntry, BooleanLogEntry, DoubleArrayLogEntry, DoubleLogEntry,
        FloatArrayLogEntry, FloatLogEntry, IntegerArrayLogEntry, IntegerLogEntry, RawLogEntry,
        StringArrayLogEntry, StringLogEntry,
    },
    DataLogReader, DataLogWriter, DataType, Record,
};

const USAGE: &str = "usage: wpidatalog generate <file> | wpidatalog read <file> [count]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = env::args().collect::<Vec<String>>();
    match args.get(1).map(String::as_str) {
        Some("generate") => {
            let filename = args.get(2).context("Need a file to write to")?;
            generate(filename)
        }
        Some("read") => {
            let filename = args.get(2).context("Need a file to read from")?;
            let count = args.get(3).and_then(|c| c.parse().ok()).unwrap_or(10);
            read(filename, count)
        }
        _ => bail!(USAGE),
    }
}

/// Writes one entry of every data type, updated a few times each.
fn generate(filename: &str) -> Result<()> {
    let writer = DataLogWriter::create(filename)?;

    let raw = RawLogEntry::new(&writer, "NT:Primitives/raw", 0);
    let boolean = BooleanLogEntry::new(&writer, "NT:Primitives/boolean", 0);
    let int64 = IntegerLogEntry::new(&writer, "NT:Primitives/int64", 0);
    let float = FloatLogEntry::new(&writer, "NT:Primitives/float", 0);
    let double = DoubleLogEntry::new(&writer, "NT:Primitives/double", 0);
    let string = StringLogEntry::new(&writer, "NT:Primitives/string", 0);

    let boolean_array = BooleanArrayLogEntry::new(&writer, "NT:Array/Booleans", 0);
    let int64_array = IntegerArrayLogEntry::new(&writer, "NT:Array/int64", 0);
    let float_array = FloatArrayLogEntry::new(&writer, "NT:Array/float", 0);
    let double_array = DoubleArrayLogEntry::new(&writer, "NT:Array/double", 0);
    let string_array = StringArrayLogEntry::new(&writer, "NT:Array/string", 0);

    let time = 1_000_000;
    raw.update(&[0, 0], time);
    boolean.update(&false, time);
    int64.update(&1, time);
    float.update(&0.25, time);
    double.update(&0.000_000_000_25, time);
    string.update("Hello", time);
    boolean_array.update(&[false, false], time);
    int64_array.update(&[-2, -1], time);
    float_array.update(&[-1.0, -0.5], time);
    double_array.update(&[-0.000_000_000_1, -0.000_000_000_5], time);
    string_array.update_strs(&["Hello", ", ", "World", "!"], time);

    let time = 2_000_000;
    raw.update(&[0, 1], time);
    int64.update(&2, time);
    float.update(&0.50, time);
    double.update(&0.000_000_000_50, time);
    string.update(", ", time);
    boolean_array.update(&[false, true], time);
    float_array.update(&[-0.5, -0.0], time);
    double_array.update(&[-0.000_000_000_5, -0.0], time);

    let time = 3_000_000;
    raw.update(&[1, 1], time);
    boolean.update(&true, time);
    int64.update(&4, time);
    float.update(&0.75, time);
    double.update(&0.000_000_000_75, time);
    string.update("World", time);
    boolean_array.update(&[true, false], time);
    int64_array.update(&[0, 1], time);
    float_array.update(&[0.0, 0.5], time);
    double_array.update(&[0.0, 0.000_000_000_5], time);
    string_array.update_strs(&["Goodbye", ", ", "World", "!"], time);

    let time = 4_000_000;
    raw.update(&[1, 0], time);
    int64.update(&8, time);
    float.update(&1.0, time);
    double.update(&0.000_000_000_10, time);
    string.update("!", time);
    boolean_array.update(&[true, true], time);
    int64_array.update(&[1, 2], time);
    float_array.update(&[0.5, 1.0], time);
    double_array.update(&[0.000_000_000_5, 0.000_000_000_1], time);

    // unchanged, so nothing is written
    let time = 5_000_000;
    int64.update(&8, time);

    writer.flush();
    println!("Wrote {filename}");
    Ok(())
}

fn read(filename: &str, count: usize) -> Result<()> {
    let reader = DataLogReader::open(filename)?;
    if !reader.is_valid() {
        bail!("{filename} is not a data log");
    }

    println!("Reading first {count} record(s) from {filename}");
    if !reader.extra_header().is_empty() {
        println!("Extra header: {}", reader.extra_header());
    }

    let mut types: HashMap<i32, DataType> = HashMap::new();
    let mut records = 0;
    for record in reader.records() {
        if let Some(start) = record.start_data() {
            types.insert(start.entry, DataType::parse(start.r#type));
        }

        if records < count {
            let value = types
                .get(&record.entry())
                .and_then(|data_type| record.value(data_type));
            match value {
                Some(value) => {
                    println!("{:>12} [{}] {value:?}", record.timestamp(), record.entry());
                }
                None => println!("{:?}", Record::try_from(record)?),
            }
        }

        records += 1;
    }

    println!("The file had {records} record(s) in total.");

    Ok(())
}
