// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: compiledb  —  compile_commands.json aggregation
//
//  One entry per compile command executed or that would have been executed
//  (cache hits and --only-compilation-database runs included).  Entries are
//  appended from workers and stable-sorted by source file on save so the
//  output is byte-identical across runs.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CompileCommand {
    pub directory: String,
    pub arguments: Vec<String>,
    pub file:      String,
}

#[derive(Debug)]
pub struct CompilationDatabase {
    path:    PathBuf,
    entries: Mutex<Vec<CompileCommand>>,
}

impl CompilationDatabase {
    pub fn new(path: &Path) -> Self {
        CompilationDatabase {
            path:    path.to_owned(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, directory: &Path, file: &Path, arguments: Vec<String>) {
        self.entries.lock().unwrap().push(CompileCommand {
            directory: directory.to_string_lossy().into_owned(),
            arguments,
            file: file.to_string_lossy().into_owned(),
        });
    }

    /// Write the database, sorted by absolute source path.
    pub fn save(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort_by(|a, b| a.file.cmp(&b.file));
        let json = serde_json::to_string_pretty(&entries)
            .expect("compile command serialization cannot fail");
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn saved_entries_are_sorted_by_file() {
        let dir = TempDir::new().unwrap();
        let db = CompilationDatabase::new(&dir.path().join("compile_commands.json"));
        db.add(dir.path(), Path::new("/b/z.cpp"), vec!["g++".into()]);
        db.add(dir.path(), Path::new("/a/a.cpp"), vec!["g++".into()]);
        db.save().unwrap();

        let text = std::fs::read_to_string(dir.path().join("compile_commands.json")).unwrap();
        let a = text.find("/a/a.cpp").unwrap();
        let z = text.find("/b/z.cpp").unwrap();
        assert!(a < z);
    }
}
