//! Entries merged across several indexed log files.
//!
//! Files live in an arena and are referred to by [`FileId`] tokens. A token
//! for a closed file never resolves again, even if its slot is reused.

use std::{collections::BTreeMap, path::Path};

use anyhow::Result;
use tracing::debug;

use crate::{
    index::{DataLogReaderThread, IndexEvent},
    reader::DataLogReader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    index: u32,
    generation: u32,
}

struct FileSlot {
    generation: u32,
    file: Option<DataLogReaderThread>,
}

/// An entry name as seen across every open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    /// Type from the first start seen.
    pub r#type: String,
    pub metadata: String,
    /// Some start used a different type.
    pub type_conflict: bool,
    /// Some start used different metadata.
    pub metadata_conflict: bool,
    pub files: Vec<FileId>,
}

impl CatalogEntry {
    fn new(file: FileId, name: &str, r#type: &str, metadata: &str) -> Self {
        CatalogEntry {
            name: name.to_owned(),
            r#type: r#type.to_owned(),
            metadata: metadata.to_owned(),
            type_conflict: false,
            metadata_conflict: false,
            files: vec![file],
        }
    }

    fn merge(&mut self, file: FileId, r#type: &str, metadata: &str) {
        if !self.files.contains(&file) {
            self.files.push(file);
        }
        self.type_conflict |= self.r#type != r#type;
        self.metadata_conflict |= self.metadata != metadata;
    }
}

#[derive(Default)]
pub struct EntryCatalog {
    files: Vec<FileSlot>,
    free: Vec<u32>,
    entries: BTreeMap<String, CatalogEntry>,
}

impl EntryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory-maps and starts indexing the log at `path`.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<FileId> {
        self.add_reader(DataLogReader::open(path)?)
    }

    pub fn add_reader(&mut self, reader: DataLogReader) -> Result<FileId> {
        let thread = DataLogReaderThread::new(reader)?;

        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.files[index as usize];
            slot.file = Some(thread);
            FileId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.files.len() as u32;
            self.files.push(FileSlot {
                generation: 0,
                file: Some(thread),
            });
            FileId {
                index,
                generation: 0,
            }
        };
        debug!(?id, "catalog opened file");
        Ok(id)
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> Option<&DataLogReaderThread> {
        let slot = self.files.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.file.as_ref()
    }

    #[must_use]
    pub fn is_open(&self, id: FileId) -> bool {
        self.file(id).is_some()
    }

    pub fn files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.files.iter().enumerate().filter_map(|(index, slot)| {
            slot.file.as_ref().map(|_| FileId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    /// Whether any open file is still being indexed.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.files
            .iter()
            .filter_map(|slot| slot.file.as_ref())
            .any(|file| !file.is_done())
    }

    /// Drains index events from every open file and, if any entry was
    /// added, re-merges from the files' current entry snapshots. Returns
    /// how many entries were added.
    pub fn poll(&mut self) -> usize {
        let added: usize = self
            .files
            .iter()
            .filter_map(|slot| slot.file.as_ref())
            .flat_map(DataLogReaderThread::poll_events)
            .filter(|event| matches!(event, IndexEvent::EntryAdded { .. }))
            .count();
        if added > 0 {
            self.rebuild();
        }
        added
    }

    /// Blocks until every open file is indexed, then merges their events.
    pub fn wait(&mut self) -> usize {
        for slot in &mut self.files {
            if let Some(file) = &mut slot.file {
                file.wait();
            }
        }
        self.poll()
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Closes a file. Entries only it contained are removed and conflict
    /// flags are recomputed from the files that remain, the same way
    /// [`poll`](Self::poll) computes them.
    pub fn close(&mut self, id: FileId) -> bool {
        let Some(slot) = self.files.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.file.is_none() {
            return false;
        }
        slot.file = None;
        slot.generation += 1;
        self.free.push(id.index);
        debug!(?id, "catalog closed file");

        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        self.entries.clear();
        for (index, slot) in self.files.iter().enumerate() {
            let Some(file) = &slot.file else {
                continue;
            };
            let id = FileId {
                index: index as u32,
                generation: slot.generation,
            };
            for data in file.entries() {
                merge_entry(&mut self.entries, id, &data.name, &data.r#type, &data.metadata);
            }
        }
    }
}

fn merge_entry(
    entries: &mut BTreeMap<String, CatalogEntry>,
    file: FileId,
    name: &str,
    r#type: &str,
    metadata: &str,
) {
    match entries.get_mut(name) {
        Some(entry) => entry.merge(file, r#type, metadata),
        None => {
            entries.insert(name.to_owned(), CatalogEntry::new(file, name, r#type, metadata));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::{flushed, test_writer};

    fn log_with(entries: &[(&str, &str, &str)]) -> DataLogReader {
        let writer = test_writer();
        for (name, r#type, metadata) in entries {
            writer.start(name, r#type, metadata, 1);
        }
        DataLogReader::new(flushed(&writer))
    }

    #[test]
    fn merges_entries_across_files() {
        let mut catalog = EntryCatalog::new();
        let first = catalog
            .add_reader(log_with(&[("a", "double", ""), ("b", "int64", "x")]))
            .unwrap();
        let second = catalog
            .add_reader(log_with(&[("a", "double", ""), ("b", "string", "y")]))
            .unwrap();

        assert_eq!(catalog.wait(), 4);
        assert!(!catalog.is_loading());

        let a = catalog.entry("a").unwrap();
        assert_eq!(a.files, vec![first, second]);
        assert!(!a.type_conflict && !a.metadata_conflict);

        let b = catalog.entry("b").unwrap();
        assert_eq!(b.r#type, "int64");
        assert!(b.type_conflict);
        assert!(b.metadata_conflict);
    }

    #[test]
    fn closing_removes_orphans_and_conflicts() {
        let mut catalog = EntryCatalog::new();
        let first = catalog
            .add_reader(log_with(&[("a", "double", ""), ("only", "int64", "")]))
            .unwrap();
        let second = catalog
            .add_reader(log_with(&[("a", "float", "")]))
            .unwrap();
        catalog.wait();
        assert!(catalog.entry("a").unwrap().type_conflict);

        assert!(catalog.close(first));
        assert!(!catalog.close(first));
        assert!(catalog.entry("only").is_none());
        let a = catalog.entry("a").unwrap();
        assert_eq!(a.r#type, "float");
        assert!(!a.type_conflict);
        assert_eq!(a.files, vec![second]);
    }

    #[test]
    fn metadata_conflicts_use_current_metadata() {
        let writer = test_writer();
        let id = writer.start("a", "double", "x", 1);
        writer.set_metadata(id, "y", 2);
        let changed = DataLogReader::new(flushed(&writer));

        let mut catalog = EntryCatalog::new();
        catalog.add_reader(changed).unwrap();
        catalog
            .add_reader(log_with(&[("a", "double", "y")]))
            .unwrap();
        let other = catalog.add_reader(log_with(&[("b", "int64", "")])).unwrap();
        catalog.wait();

        let before = catalog.entry("a").unwrap().clone();
        assert_eq!(before.metadata, "y");
        assert!(!before.metadata_conflict);

        // closing an unrelated file must not change the verdict
        assert!(catalog.close(other));
        assert_eq!(catalog.entry("a"), Some(&before));
    }

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut catalog = EntryCatalog::new();
        let first = catalog.add_reader(log_with(&[])).unwrap();
        catalog.close(first);

        let reused = catalog.add_reader(log_with(&[])).unwrap();
        assert_ne!(first, reused);
        assert!(catalog.file(first).is_none());
        assert!(catalog.is_open(reused));
        assert_eq!(catalog.files().collect::<Vec<_>>(), vec![reused]);
    }
}
