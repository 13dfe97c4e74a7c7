// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: options  —  build.options.json gatekeeper
//
//  A canonical snapshot of every input that invalidates the build cache.
//  When the stored snapshot differs from the current one (or --clean was
//  passed) the build directory contents are wiped before anything else
//  runs; the directory itself is kept.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logger::BuildLogger;

const OPTIONS_FILE: &str = "build.options.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub hardware_dirs:           Vec<String>,
    pub builtin_tools_dirs:      Vec<String>,
    pub builtin_libraries_dirs:  Vec<String>,
    pub other_libraries_dirs:    Vec<String>,
    pub sketch_location:         String,
    pub fqbn:                    String,
    pub custom_build_properties: Vec<String>,
    pub compiler_optimization_flags: String,
    pub platform:                String,
}

impl BuildOptions {
    /// Compare with the stored snapshot and wipe the build tree when the
    /// inputs changed.  Returns true when a wipe happened.
    pub fn enforce(&self, build_path: &Path, clean: bool, logger: &BuildLogger) -> Result<bool> {
        std::fs::create_dir_all(build_path)?;
        let file = build_path.join(OPTIONS_FILE);

        let stored: Option<BuildOptions> = std::fs::read_to_string(&file)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok());

        let wipe = clean || stored.as_ref() != Some(self);
        if wipe {
            if stored.is_some() && !clean {
                logger.info("Build options changed, rebuilding all");
            }
            wipe_dir_contents(build_path)?;
        }

        let json = serde_json::to_string_pretty(self)
            .expect("build options serialization cannot fail");
        std::fs::write(&file, json)?;
        Ok(wipe)
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn wipe_dir_contents(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path: PathBuf = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(fqbn: &str) -> BuildOptions {
        BuildOptions {
            hardware_dirs:           vec!["/hw".into()],
            builtin_tools_dirs:      vec!["/tools".into()],
            builtin_libraries_dirs:  vec!["/libs".into()],
            other_libraries_dirs:    Vec::new(),
            sketch_location:         "/sketch/Blink".into(),
            fqbn:                    fqbn.into(),
            custom_build_properties: Vec::new(),
            compiler_optimization_flags: "-Os".into(),
            platform:                "arduino:avr@1.8.6".into(),
        }
    }

    #[test]
    fn first_build_counts_as_mismatch_and_writes_snapshot() {
        let tmp = TempDir::new().unwrap();
        let wiped = options("arduino:avr:uno")
            .enforce(tmp.path(), false, &BuildLogger::default())
            .unwrap();
        assert!(wiped, "no snapshot yet counts as a mismatch");
        assert!(tmp.path().join(OPTIONS_FILE).is_file());
    }

    #[test]
    fn unchanged_options_keep_artifacts() {
        let tmp = TempDir::new().unwrap();
        let logger = BuildLogger::default();
        options("arduino:avr:uno").enforce(tmp.path(), false, &logger).unwrap();

        let artifact = tmp.path().join("sketch");
        std::fs::create_dir_all(&artifact).unwrap();
        std::fs::write(artifact.join("a.o"), [0u8; 2]).unwrap();

        let wiped = options("arduino:avr:uno").enforce(tmp.path(), false, &logger).unwrap();
        assert!(!wiped);
        assert!(artifact.join("a.o").is_file());
    }

    #[test]
    fn fqbn_change_empties_the_build_dir() {
        let tmp = TempDir::new().unwrap();
        let logger = BuildLogger::default();
        options("arduino:avr:uno").enforce(tmp.path(), false, &logger).unwrap();

        let artifact = tmp.path().join("sketch");
        std::fs::create_dir_all(&artifact).unwrap();
        std::fs::write(artifact.join("a.o"), [0u8; 2]).unwrap();

        let wiped = options("arduino:avr:mega").enforce(tmp.path(), false, &logger).unwrap();
        assert!(wiped);
        assert!(!artifact.exists());
        // The directory itself and the fresh snapshot survive.
        assert!(tmp.path().is_dir());
        assert!(tmp.path().join(OPTIONS_FILE).is_file());
    }

    #[test]
    fn explicit_clean_always_wipes() {
        let tmp = TempDir::new().unwrap();
        let logger = BuildLogger::default();
        options("arduino:avr:uno").enforce(tmp.path(), false, &logger).unwrap();
        std::fs::write(tmp.path().join("stale.o"), [0u8; 2]).unwrap();

        let wiped = options("arduino:avr:uno").enforce(tmp.path(), true, &logger).unwrap();
        assert!(wiped);
        assert!(!tmp.path().join("stale.o").exists());
    }
}
