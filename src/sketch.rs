// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: sketch  —  sketch folder model
//
//  A sketch is a folder with one main unit (same base name as the folder,
//  .ino or .pde), extra units merged after it in filename order, and
//  companion .h/.c/.cpp/.S files compiled as ordinary translation units.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{BuildError, Result};

const UNIT_EXTENSIONS: &[&str] = &["ino", "pde"];
const COMPANION_SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "S"];

#[derive(Debug, Clone)]
pub struct Sketch {
    pub folder:           PathBuf,
    pub name:             String,
    pub main_unit:        PathBuf,
    /// Extra .ino/.pde units, sorted by filename.
    pub additional_units: Vec<PathBuf>,
    /// Companion .c/.cpp/.S sources (root level and src/).
    pub companion_sources: Vec<PathBuf>,
}

impl Sketch {
    /// Load a sketch from its folder (or from a path to its main unit).
    pub fn load(path: &Path) -> Result<Sketch> {
        let folder = if path.is_file() {
            path.parent().unwrap_or(Path::new(".")).to_owned()
        } else {
            path.to_owned()
        };
        if !folder.is_dir() {
            return Err(BuildError::SketchNotFound(path.to_owned()));
        }
        let folder = folder.canonicalize()?;
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BuildError::SketchNotFound(path.to_owned()))?;

        // The main unit must match the folder base name exactly.
        let main_unit = UNIT_EXTENSIONS
            .iter()
            .map(|ext| folder.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file());
        let main_unit = match main_unit {
            Some(p) => p,
            None => {
                // A lone unit with the wrong name is a mismatch, an empty
                // folder is simply not a sketch.
                let stray = first_unit_in(&folder);
                return match stray {
                    Some(file) => Err(BuildError::SketchNameMismatch {
                        file:   file.file_name().unwrap_or_default().to_string_lossy().into_owned(),
                        folder: name,
                    }),
                    None => Err(BuildError::SketchNotFound(path.to_owned())),
                };
            }
        };

        let mut additional_units: Vec<PathBuf> = Vec::new();
        let mut companion_sources: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(&folder)
            .max_depth(1)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
        {
            let p = entry.path();
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            if UNIT_EXTENSIONS.contains(&ext) {
                if p != main_unit {
                    additional_units.push(p.to_owned());
                }
            } else if COMPANION_SOURCE_EXTENSIONS.contains(&ext) {
                companion_sources.push(p.to_owned());
            }
        }
        // src/ subfolder sources are part of the sketch as well.
        let src_dir = folder.join("src");
        if src_dir.is_dir() {
            for entry in WalkDir::new(&src_dir)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
            {
                let p = entry.path();
                let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
                if COMPANION_SOURCE_EXTENSIONS.contains(&ext) {
                    companion_sources.push(p.to_owned());
                }
            }
        }
        additional_units.sort_by_key(|p| p.file_name().map(|n| n.to_owned()));
        companion_sources.sort();

        Ok(Sketch {
            folder,
            name,
            main_unit,
            additional_units,
            companion_sources,
        })
    }

    /// All units in merge order: main first, then the extras.
    pub fn units(&self) -> Vec<&Path> {
        let mut out: Vec<&Path> = vec![self.main_unit.as_path()];
        out.extend(self.additional_units.iter().map(|p| p.as_path()));
        out
    }

    /// Path strings as they will appear in `#line` directives.
    pub fn unit_paths(&self) -> Vec<String> {
        self.units()
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// Concatenate all units into one C++ translation unit with `#line`
    /// directives mapping each region back to its source file, injecting
    /// `#include <Arduino.h>` when no unit includes it already.
    pub fn merged_source(&self) -> Result<String> {
        let mut out = String::new();
        let mut needs_arduino_h = true;
        let mut bodies: Vec<(String, String)> = Vec::new();

        for unit in self.units() {
            let text = std::fs::read_to_string(unit)?;
            if includes_arduino_h(&text) {
                needs_arduino_h = false;
            }
            bodies.push((unit.to_string_lossy().into_owned(), text));
        }

        if needs_arduino_h {
            out.push_str("#include <Arduino.h>\n");
        }
        for (path, text) in &bodies {
            out.push_str(&format!("#line 1 \"{}\"\n", path));
            out.push_str(text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }
}

fn first_unit_in(folder: &Path) -> Option<PathBuf> {
    let mut units: Vec<PathBuf> = std::fs::read_dir(folder)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| UNIT_EXTENSIONS.contains(&ext))
        })
        .collect();
    units.sort();
    units.into_iter().next()
}

/// Cheap scan for an existing `#include <Arduino.h>` (or "Arduino.h").
fn includes_arduino_h(text: &str) -> bool {
    for line in text.lines() {
        let t = line.trim_start();
        if let Some(rest) = t.strip_prefix("#include") {
            let rest = rest.trim_start();
            if rest.starts_with("<Arduino.h>") || rest.starts_with("\"Arduino.h\"") {
                return true;
            }
        }
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
