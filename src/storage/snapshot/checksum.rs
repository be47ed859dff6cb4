//! Per-file checksums of a snapshot directory, stored in SFV format.
//!
//! ```text
//! ; combined checksum = 8f3a6b21
//! runtime.db  1c291ca3
//! zeebe.state  0a44cc1e
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, Read, Write};
use std::path::Path;

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;

const COMBINED_CHECKSUM_PREFIX: &str = "; combined checksum = ";
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Checksums keyed by file name relative to the snapshot directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    checksums: BTreeMap<String, u64>,
}

impl ChecksumSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the checksums of the files directly inside `dir`, skipping `excluded`.
    ///
    /// Snapshots are flat: any entry that is not a regular file fails with
    /// [`SnapshotError::Corrupted`].
    pub fn from_directory(dir: &Path, excluded: &[&str]) -> SnapshotResult<Self> {
        let mut set = Self::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type()?.is_file() {
                return Err(SnapshotError::Corrupted(format!(
                    "{:?} is not a regular file",
                    entry.path()
                )));
            }
            if excluded.contains(&name.as_str()) {
                continue;
            }
            set.insert(name, file_checksum(&entry.path())?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, name: impl Into<String>, checksum: u64) {
        self.checksums.insert(name.into(), checksum);
    }

    /// Extends the checksum of `name` as if `content` was appended to the file.
    pub fn update(&mut self, name: &str, content: &[u8]) {
        let checksum = self.checksums.entry(name.to_string()).or_insert(0);
        let mut hasher = crc32fast::Hasher::new_with_initial(*checksum as u32);
        hasher.update(content);
        *checksum = hasher.finalize() as u64;
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.checksums.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checksums.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.checksums.iter().map(|(name, c)| (name.as_str(), *c))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checksums.keys().map(String::as_str)
    }

    /// One checksum over all files. Independent of the order files were added in.
    pub fn combined_checksum(&self) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        for checksum in self.checksums.values() {
            hasher.update(&checksum.to_le_bytes());
        }
        hasher.finalize() as u64
    }

    /// Whether both sets cover the same files with the same checksums.
    pub fn same_checksums(&self, other: &ChecksumSet) -> bool {
        self.checksums == other.checksums
    }

    pub fn write_sfv<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(
            writer,
            "{}{:08x}",
            COMBINED_CHECKSUM_PREFIX,
            self.combined_checksum()
        )?;
        for (name, checksum) in &self.checksums {
            writeln!(writer, "{}  {:08x}", name, checksum)?;
        }
        writer.flush()
    }

    pub fn read_sfv<R: BufRead>(reader: R) -> SnapshotResult<Self> {
        let mut set = Self::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let (name, hex) = line
                .rsplit_once(' ')
                .ok_or_else(|| SnapshotError::Corrupted(format!("invalid SFV line '{}'", line)))?;
            let checksum = u64::from_str_radix(hex, 16).map_err(|e| {
                SnapshotError::Corrupted(format!("invalid checksum in SFV line '{}': {}", line, e))
            })?;
            set.insert(name.trim_end(), checksum);
        }
        Ok(set)
    }

    pub fn write_sfv_file(&self, path: &Path, sync: bool) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        self.write_sfv(&mut file)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn read_sfv_file(path: &Path) -> SnapshotResult<Self> {
        let file = File::open(path)?;
        Self::read_sfv(std::io::BufReader::new(file))
    }
}

/// CRC32 of a whole file.
pub fn file_checksum(path: &Path) -> std::io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize() as u64)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sample() -> ChecksumSet {
        let mut set = ChecksumSet::new();
        set.insert("b.sst", 0xdead_beef);
        set.insert("a.sst", 0x1234);
        set
    }

    #[test]
    fn test_combined_checksum_is_order_independent() {
        let mut other = ChecksumSet::new();
        other.insert("a.sst", 0x1234);
        other.insert("b.sst", 0xdead_beef);

        assert_eq!(sample().combined_checksum(), other.combined_checksum());
        assert!(sample().same_checksums(&other));
    }

    #[test]
    fn test_same_checksums_is_reflexive_and_symmetric() {
        let a = sample();
        let mut b = sample();
        assert!(a.same_checksums(&a));
        assert!(a.same_checksums(&b) && b.same_checksums(&a));

        b.insert("a.sst", 0x1235);
        assert!(!a.same_checksums(&b));
        assert!(!b.same_checksums(&a));
        assert_ne!(a.combined_checksum(), b.combined_checksum());
    }

    #[test]
    fn test_sfv_round_trip() {
        let set = sample();
        let mut out = Vec::new();
        set.write_sfv(&mut out).unwrap();

        let text = String::from_utf8(out.clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            format!("; combined checksum = {:08x}", set.combined_checksum())
        );
        assert_eq!(lines[1], "a.sst  00001234");
        assert_eq!(lines[2], "b.sst  deadbeef");

        let parsed = ChecksumSet::read_sfv(out.as_slice()).unwrap();
        assert!(parsed.same_checksums(&set));
    }

    #[test]
    fn test_read_sfv_rejects_garbage() {
        let result = ChecksumSet::read_sfv("file  not-hex\n".as_bytes());
        assert!(matches!(result, Err(SnapshotError::Corrupted(_))));
    }

    #[test]
    fn test_incremental_update_matches_whole_file() {
        let dir = TempDir::new().unwrap();
        let content = b"hello snapshot world".repeat(100);
        fs::write(dir.path().join("data"), &content).unwrap();

        let mut set = ChecksumSet::new();
        for chunk in content.chunks(7) {
            set.update("data", chunk);
        }

        let from_dir = ChecksumSet::from_directory(dir.path(), &[]).unwrap();
        assert!(set.same_checksums(&from_dir));
    }

    #[test]
    fn test_single_byte_change_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"aaaa").unwrap();
        fs::write(dir.path().join("b"), b"bbbb").unwrap();
        fs::write(dir.path().join("skip"), b"ignored").unwrap();

        let before = ChecksumSet::from_directory(dir.path(), &["skip"]).unwrap();
        assert_eq!(before.len(), 2);
        assert!(!before.contains("skip"));

        fs::write(dir.path().join("b"), b"bbbc").unwrap();
        let after = ChecksumSet::from_directory(dir.path(), &["skip"]).unwrap();
        assert!(!before.same_checksums(&after));
    }

    #[test]
    fn test_nested_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"aaaa").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("b"), b"bbbb").unwrap();

        assert!(matches!(
            ChecksumSet::from_directory(dir.path(), &[]),
            Err(SnapshotError::Corrupted(_))
        ));
    }
}
