//! Indexes a log on a background thread and summarizes its entries.
//!
//! `cargo run --example read -- <file>`

use anyhow::{Context, Result};
use std::env;
use wpidatalog::{DataLogReader, DataLogReaderThread, IndexEvent};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let filename = env::args().nth(1).context("Need a file to read from")?;
    let index = DataLogReaderThread::new(DataLogReader::open(&filename)?)?;

    // follow progress the way a UI would
    while let Ok(event) = index.events().recv() {
        match event {
            IndexEvent::EntryAdded { entry, name, r#type, .. } => {
                println!("  [{entry}] {name} ({})", r#type);
            }
            IndexEvent::Done => break,
        }
    }

    println!(
        "{filename}: {} record(s), {} entries",
        index.record_count(),
        index.entry_count()
    );
    for entry in index.entries() {
        let records: usize = entry
            .ranges
            .iter()
            .map(|&range| index.records_in(range).filter(|r| !r.is_control()).count())
            .sum();
        println!(
            "{} ({}): {} range(s), {records} value(s)",
            entry.name,
            entry.data_type,
            entry.ranges.len()
        );
    }

    index.with_schemas(|schemas| {
        for name in schemas.struct_names() {
            let schema = schemas.struct_schema(name).unwrap_or_default();
            println!("struct {name}: {}", String::from_utf8_lossy(schema));
        }
    });

    Ok(())
}
