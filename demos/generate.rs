//! Logs a simulated robot to rotating files from a background thread.
//!
//! `cargo run --example generate -- <dir>`

use anyhow::Result;
use std::{env, thread, time::Duration};
use wpidatalog::{
    entrytypes::{BooleanLogEntry, DoubleLogEntry, StringLogEntry},
    structs::{StructLogEntry, StructSerializable},
    BackgroundWriterConfig, DataLogBackgroundWriter,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Translation2d {
    x: f64,
    y: f64,
}

impl StructSerializable for Translation2d {
    const TYPE_NAME: &'static str = "Translation2d";
    const SIZE: usize = 16;
    const SCHEMA: &'static str = "double x;double y";

    fn pack(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.x.to_le_bytes());
        out[8..].copy_from_slice(&self.y.to_le_bytes());
    }

    fn unpack(data: &[u8]) -> Self {
        let mut x = [0; 8];
        let mut y = [0; 8];
        x.copy_from_slice(&data[..8]);
        y.copy_from_slice(&data[8..16]);
        Translation2d {
            x: f64::from_le_bytes(x),
            y: f64::from_le_bytes(y),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let dir = env::args().nth(1).unwrap_or_else(|| ".".into());
    let config = BackgroundWriterConfig::new()
        .with_dir(dir)
        .with_period(Duration::from_millis(100))
        .with_extra_header("demo robot");
    let writer = DataLogBackgroundWriter::new(config)?;

    let mode = StringLogEntry::new(&writer, "/robot/mode", 0);
    let enabled = BooleanLogEntry::new(&writer, "/robot/enabled", 0);
    let voltage = DoubleLogEntry::with_metadata(&writer, "/robot/voltage", r#"{"unit":"V"}"#, 0);
    let position = StructLogEntry::<Translation2d>::new(&writer, "/robot/position", 0);

    mode.update("disabled", 0);
    for tick in 0..500u32 {
        let t = f64::from(tick) * 0.02;
        if tick == 50 {
            mode.update("autonomous", 0);
        }
        enabled.update(&(tick >= 50), 0);
        voltage.update(&(12.6 - t * 0.05), 0);
        position.append(
            &Translation2d {
                x: t.cos(),
                y: t.sin(),
            },
            0,
        );
        thread::sleep(Duration::from_millis(2));
    }

    writer.set_filename("demo.wpilog");
    Ok(())
}
