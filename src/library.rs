// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: library  —  installed-library model
//
//  A library is a directory with an optional library.properties manifest.
//  Layout flavors:
//    flat       headers and sources at the top level (+ utility/)
//    recursive  manifest present AND a src/ directory: everything under src/
//
//  Location classes record where a library was found; the resolver uses
//  them as a ranking signal and the orchestrator groups report output by
//  them.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::props::PropertyMap;

const HEADER_EXTENSIONS: &[&str] = &["h", "hpp"];
const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocationClass {
    IdeBuiltin,
    PlatformBuiltin,
    ReferencedPlatformBuiltin,
    User,
    Unmanaged,
}

impl LocationClass {
    pub fn ordinal(self) -> u8 {
        match self {
            LocationClass::IdeBuiltin                => 0,
            LocationClass::PlatformBuiltin           => 1,
            LocationClass::ReferencedPlatformBuiltin => 2,
            LocationClass::User                      => 3,
            LocationClass::Unmanaged                 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryLayout {
    Flat,
    Recursive,
}

#[derive(Debug, Clone)]
pub struct Library {
    pub name:          String,
    pub version:       String,
    pub author:        String,
    /// Declared architectures; an absent manifest field means `*`.
    pub architectures: Vec<String>,
    pub dependencies:  Vec<String>,
    pub layout:        LibraryLayout,
    pub root:          PathBuf,
    /// Basenames of every header this library provides at its include root.
    pub headers:       BTreeSet<String>,
    pub location:      LocationClass,
}

impl Library {
    /// Load one library directory; `None` when the directory provides no
    /// headers at all (not a usable library).
    pub fn load(dir: &Path, location: LocationClass) -> Option<Library> {
        if !dir.is_dir() {
            return None;
        }
        let folder_name = dir.file_name()?.to_string_lossy().into_owned();
        let manifest_path = dir.join("library.properties");
        let manifest = manifest_path
            .is_file()
            .then(|| PropertyMap::load_from_file(&manifest_path).ok())
            .flatten();

        let layout = match &manifest {
            Some(_) if dir.join("src").is_dir() => LibraryLayout::Recursive,
            _ => LibraryLayout::Flat,
        };

        let headers = match layout {
            LibraryLayout::Flat => headers_in(dir, 1),
            LibraryLayout::Recursive => headers_in(&dir.join("src"), usize::MAX),
        };
        if headers.is_empty() {
            return None;
        }

        let (name, version, author, architectures, dependencies) = match &manifest {
            Some(m) => (
                m.get("name").unwrap_or(&folder_name).to_owned(),
                m.get("version").unwrap_or("").to_owned(),
                m.get("author").unwrap_or("").to_owned(),
                split_csv(m.get("architectures").unwrap_or("*")),
                split_csv(m.get("depends").unwrap_or("")),
            ),
            None => (folder_name.clone(), String::new(), String::new(), vec!["*".to_owned()], Vec::new()),
        };

        Some(Library {
            name,
            version,
            author,
            architectures,
            dependencies,
            layout,
            root: dir.to_owned(),
            headers,
            location,
        })
    }

    pub fn folder_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// True when the declared architectures cover `arch` (or are `*`).
    pub fn supports_arch(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == "*" || a == arch)
    }

    /// True when `arch` is declared explicitly, not just via `*`.
    pub fn declares_arch(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }

    pub fn provides_header(&self, header: &str) -> bool {
        self.headers.contains(header)
    }

    /// Directories to add to the compiler include path.
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        match self.layout {
            LibraryLayout::Flat => {
                let mut dirs = vec![self.root.clone()];
                let utility = self.root.join("utility");
                if utility.is_dir() {
                    dirs.push(utility);
                }
                dirs
            }
            LibraryLayout::Recursive => vec![self.root.join("src")],
        }
    }

    /// Compilable sources, sorted for deterministic build order.
    pub fn sources(&self) -> Vec<PathBuf> {
        let (base, depth) = match self.layout {
            LibraryLayout::Flat => (self.root.clone(), 1),
            LibraryLayout::Recursive => (self.root.join("src"), usize::MAX),
        };
        let mut out = sources_in(&base, depth);
        if self.layout == LibraryLayout::Flat {
            out.extend(sources_in(&self.root.join("utility"), 1));
        }
        out.sort();
        out
    }
}

fn headers_in(dir: &Path, depth: usize) -> BTreeSet<String> {
    WalkDir::new(dir)
        .max_depth(depth)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let p = e.path();
            let ext = p.extension().and_then(|x| x.to_str())?;
            HEADER_EXTENSIONS
                .contains(&ext)
                .then(|| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .flatten()
        })
        .collect()
}

fn sources_in(dir: &Path, depth: usize) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .max_depth(depth)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
        })
        .map(|e| e.path().to_owned())
        .collect()
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Scan library roots in priority order; every immediate child directory is
/// a candidate library.
pub fn scan_libraries(roots: &[(PathBuf, LocationClass)]) -> Vec<Library> {
    let mut out: Vec<Library> = Vec::new();
    for (root, location) in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            if let Some(lib) = Library::load(&dir, *location) {
                out.push(lib);
            }
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
