// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: cache  —  per-object compile cache
//
//  Every object file gets a sidecar `<name>.hash` holding the cache key:
//
//    sha256(source path ∥ 0x00 ∥ argv joined with NUL ∥ 0x00 ∥ sorted -I dirs)
//
//  A unit is fresh when the object exists, the sidecar matches the current
//  key, and the object is not older than the source.  There is no eviction:
//  the build directory as a whole is the unit of invalidation.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice, hex-encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a string slice, hex-encoded.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Compute the cache key for one compile invocation.
pub fn object_cache_key(source: &Path, argv: &[String], include_dirs: &[PathBuf]) -> String {
    let mut includes: Vec<String> = include_dirs
        .iter()
        .map(|d| d.to_string_lossy().into_owned())
        .collect();
    includes.sort();

    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(argv.join("\0").as_bytes());
    hasher.update([0u8]);
    hasher.update(includes.join("\0").as_bytes());
    hex::encode(hasher.finalize())
}

/// One source/object pair under cache control.
#[derive(Debug)]
pub struct CachedUnit {
    pub source:    PathBuf,
    pub object:    PathBuf,
    pub hash_file: PathBuf,
    key:           String,
}

impl CachedUnit {
    pub fn new(source: &Path, object: &Path, argv: &[String], include_dirs: &[PathBuf]) -> Self {
        let hash_file = object.with_extension("o.hash");
        CachedUnit {
            source:    source.to_owned(),
            object:    object.to_owned(),
            hash_file,
            key:       object_cache_key(source, argv, include_dirs),
        }
    }

    /// True when the existing object can be reused as-is.
    pub fn is_fresh(&self) -> bool {
        if !self.object.is_file() {
            return false;
        }
        match std::fs::read_to_string(&self.hash_file) {
            Ok(stored) if stored.trim() == self.key => {}
            _ => return false,
        }
        match (mtime(&self.object), mtime(&self.source)) {
            (Some(obj), Some(src)) => obj >= src,
            _ => false,
        }
    }

    /// Persist the key after a successful compile.
    pub fn record(&self) -> std::io::Result<()> {
        std::fs::write(&self.hash_file, &self.key)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn argv() -> Vec<String> {
        vec!["avr-gcc".into(), "-c".into(), "a.c".into()]
    }

    #[test]
    fn key_changes_with_flags_and_includes() {
        let src = Path::new("/tmp/a.c");
        let inc = vec![PathBuf::from("/core"), PathBuf::from("/variant")];
        let base = object_cache_key(src, &argv(), &inc);

        let mut other_argv = argv();
        other_argv.push("-Os".into());
        assert_ne!(base, object_cache_key(src, &other_argv, &inc));

        let fewer = vec![PathBuf::from("/core")];
        assert_ne!(base, object_cache_key(src, &argv(), &fewer));
    }

    #[test]
    fn include_order_does_not_matter() {
        let src = Path::new("/tmp/a.c");
        let fwd = vec![PathBuf::from("/core"), PathBuf::from("/variant")];
        let rev = vec![PathBuf::from("/variant"), PathBuf::from("/core")];
        assert_eq!(
            object_cache_key(src, &argv(), &fwd),
            object_cache_key(src, &argv(), &rev)
        );
    }

    #[test]
    fn fresh_only_after_record() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.c");
        let obj = dir.path().join("a.c.o");
        std::fs::write(&src, "int x;").unwrap();
        std::fs::write(&obj, [0u8; 4]).unwrap();

        let unit = CachedUnit::new(&src, &obj, &argv(), &[]);
        assert!(!unit.is_fresh(), "no sidecar yet");
        unit.record().unwrap();
        assert!(unit.is_fresh());
    }

    #[test]
    fn stale_when_key_differs() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.c");
        let obj = dir.path().join("a.c.o");
        std::fs::write(&src, "int x;").unwrap();
        std::fs::write(&obj, [0u8; 4]).unwrap();

        CachedUnit::new(&src, &obj, &argv(), &[]).record().unwrap();

        let mut other = argv();
        other.push("-Os".into());
        let unit = CachedUnit::new(&src, &obj, &other, &[]);
        assert!(!unit.is_fresh());
    }

    #[test]
    fn stale_when_source_newer_than_object() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.c");
        let obj = dir.path().join("a.c.o");
        std::fs::write(&obj, [0u8; 4]).unwrap();

        // Touch the source after the object.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&src, "int x;").unwrap();

        let unit = CachedUnit::new(&src, &obj, &argv(), &[]);
        unit.record().unwrap();
        assert!(!unit.is_fresh());
    }
}
