//! Collection of files an execution leaves behind in the runtime's data directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::execution::OutputFile;

/// Default size cap per collected file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Top-level entry names present before an execution started.
#[derive(Debug)]
pub struct FileSnapshot {
    dir: PathBuf,
    existing: BTreeSet<String>,
}

impl FileSnapshot {
    pub fn capture(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            existing: list(dir),
        }
    }

    /// Regular files created since the snapshot, by name, each under `max_size` bytes.
    pub fn collect_new(&self, max_size: u64) -> Vec<OutputFile> {
        let mut files = Vec::new();
        for name in list(&self.dir).difference(&self.existing) {
            let path = self.dir.join(name);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping output file");
                    continue;
                }
            };
            if !meta.is_file() || meta.len() >= max_size {
                continue;
            }
            match fs::read(&path) {
                Ok(bytes) => files.push(OutputFile::from_bytes(name.clone(), &bytes)),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping output file"),
            }
        }
        if !files.is_empty() {
            let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
            info!(count = files.len(), ?names, "collected output files");
        }
        files
    }
}

fn list(dir: &Path) -> BTreeSet<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot list data directory");
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_new_small_regular_files_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), b"before").unwrap();
        let snapshot = FileSnapshot::capture(dir.path());

        fs::write(dir.path().join("b.csv"), b"x,y\n").unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("big.bin"), vec![0u8; 64]).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("old.txt"), b"changed").unwrap();

        let files = snapshot.collect_new(64);
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.csv"]);
        assert_eq!(files[0].decode().unwrap(), b"hello");
        assert_eq!(files[0].size, 5);
    }

    #[test]
    fn missing_directory_collects_nothing() {
        let snapshot = FileSnapshot::capture(Path::new("/definitely/not/here"));
        assert!(snapshot.collect_new(DEFAULT_MAX_FILE_SIZE).is_empty());
    }
}
