// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: platform  —  board descriptor and platform discovery
//
//  Hardware lives in two on-disk layouts, both scanned:
//
//    <hw>/<vendor>/<arch>/platform.txt                 (IDE 1.x style)
//    <hw>/packages/<vendor>/hardware/<arch>/<version>/ (package-cache style)
//
//  For the package-cache style the highest installed version wins.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::props::PropertyMap;

// ─────────────────────────────────────────────────────────────────────────────
//  FQBN
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqbn {
    pub vendor:  String,
    pub arch:    String,
    pub board:   String,
    /// The `:options` tail, e.g. cpu=atmega328old, in declared order.
    pub options: Vec<(String, String)>,
}

impl Fqbn {
    pub fn parse(s: &str) -> Result<Fqbn> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(BuildError::InvalidFqbn(s.to_owned()));
        }
        let mut options = Vec::new();
        if parts.len() == 4 {
            for pair in parts[3].split(',') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| BuildError::InvalidFqbn(s.to_owned()))?;
                if k.is_empty() {
                    return Err(BuildError::InvalidFqbn(s.to_owned()));
                }
                options.push((k.to_owned(), v.to_owned()));
            }
        }
        Ok(Fqbn {
            vendor:  parts[0].to_owned(),
            arch:    parts[1].to_owned(),
            board:   parts[2].to_owned(),
            options,
        })
    }
}

impl std::fmt::Display for Fqbn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.vendor, self.arch, self.board)?;
        if !self.options.is_empty() {
            let tail: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, ":{}", tail.join(","))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Platform
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Platform {
    pub vendor:  String,
    pub arch:    String,
    pub version: String,
    pub root:    PathBuf,
    pub props:   PropertyMap,
    pub boards:  PropertyMap,
}

impl Platform {
    /// Path of the bundled libraries folder, if any.
    pub fn libraries_dir(&self) -> Option<PathBuf> {
        let dir = self.root.join("libraries");
        dir.is_dir().then_some(dir)
    }

    /// Properties of one board: the board subtree of boards.txt overlaid
    /// with any `menu.<key>.<value>` option subtrees from the FQBN tail.
    pub fn board_properties(&self, fqbn: &Fqbn) -> Result<PropertyMap> {
        let board = self.boards.subtree(&fqbn.board);
        if board.is_empty() {
            return Err(BuildError::UnknownBoard {
                vendor: self.vendor.clone(),
                arch:   self.arch.clone(),
                board:  fqbn.board.clone(),
            });
        }
        let mut out = PropertyMap::new();
        for (k, v) in board.iter() {
            if !k.starts_with("menu.") {
                out.set(k, v);
            }
        }
        for (key, value) in &fqbn.options {
            let option = board.subtree(&format!("menu.{}.{}", key, value));
            out.merge(&option);
        }
        Ok(out)
    }

    /// `(board id, display name)` pairs from boards.txt, in file order.
    pub fn board_names(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for (k, v) in self.boards.iter() {
            if let Some(id) = k.strip_suffix(".name") {
                if !id.contains('.') && !id.is_empty() {
                    out.push((id.to_owned(), v.to_owned()));
                }
            }
        }
        out
    }
}

/// Locate and load a platform from the hardware dirs, first hit wins.
pub fn find_platform(hardware_dirs: &[PathBuf], vendor: &str, arch: &str) -> Result<Platform> {
    for base in hardware_dirs {
        // IDE 1.x style: <hw>/<vendor>/<arch>/
        let direct = base.join(vendor).join(arch);
        if direct.join("boards.txt").is_file() {
            return load_platform(&direct, vendor, arch, "1.x");
        }
        // Package-cache style: <hw>/packages/<vendor>/hardware/<arch>/<ver>/
        let packaged = base
            .join("packages")
            .join(vendor)
            .join("hardware")
            .join(arch);
        if let Some(version) = latest_version_dir(&packaged) {
            let root = packaged.join(&version);
            if root.join("boards.txt").is_file() {
                return load_platform(&root, vendor, arch, &version);
            }
        }
    }
    Err(BuildError::PlatformNotFound {
        vendor:   vendor.to_owned(),
        arch:     arch.to_owned(),
        searched: hardware_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn load_platform(root: &Path, vendor: &str, arch: &str, version: &str) -> Result<Platform> {
    let props = {
        let path = root.join("platform.txt");
        if path.is_file() {
            PropertyMap::load_from_file(&path)?
        } else {
            PropertyMap::new()
        }
    };
    let mut boards = PropertyMap::load_from_file(&root.join("boards.txt"))?;
    let local = root.join("boards.local.txt");
    if local.is_file() {
        boards.merge(&PropertyMap::load_from_file(&local)?);
    }
    Ok(Platform {
        vendor:  vendor.to_owned(),
        arch:    arch.to_owned(),
        version: version.to_owned(),
        root:    root.to_owned(),
        props,
        boards,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tools
// ─────────────────────────────────────────────────────────────────────────────

/// `runtime.tools.<name>.path` entries for every installed tool, latest
/// version each, scanning `<dir>/packages/<vendor>/tools/<name>/<version>`
/// and the flat `<dir>/<name>/<version>` layout.
pub fn tool_properties(tools_dirs: &[PathBuf]) -> PropertyMap {
    let mut out = PropertyMap::new();
    for base in tools_dirs {
        let mut roots: Vec<PathBuf> = Vec::new();
        if let Ok(vendors) = std::fs::read_dir(base.join("packages")) {
            for vendor in vendors.flatten() {
                let tools = vendor.path().join("tools");
                if tools.is_dir() {
                    roots.push(tools);
                }
            }
        }
        roots.push(base.clone());
        for root in roots {
            let Ok(entries) = std::fs::read_dir(&root) else {
                continue;
            };
            let mut tool_dirs: Vec<PathBuf> =
                entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
            tool_dirs.sort();
            for tool in tool_dirs {
                let Some(name) = tool.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };
                let Some(version) = latest_version_dir(&tool) else {
                    continue;
                };
                let path = tool.join(&version);
                out.set(
                    &format!("runtime.tools.{}.path", name),
                    &path.to_string_lossy(),
                );
                out.set(
                    &format!("runtime.tools.{}-{}.path", name, version),
                    &path.to_string_lossy(),
                );
            }
        }
    }
    out
}

/// Name of the highest semver-ish subdirectory.
fn latest_version_dir(base: &Path) -> Option<String> {
    let mut versions: Vec<String> = std::fs::read_dir(base)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    if versions.is_empty() {
        return None;
    }
    versions.sort_by_key(|v| parse_version(v));
    versions.pop()
}

fn parse_version(s: &str) -> Vec<u32> {
    s.split(|c| c == '.' || c == '-' || c == '+')
        .map(|p| p.parse::<u32>().unwrap_or(0))
        .collect()
}

/// Default hardware search roots for the current user.
pub fn default_hardware_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(home) = home_dir() {
        dirs.push(home.join(".arduino15"));
        dirs.push(home.join("snap/arduino/current/.arduino15"));
        #[cfg(target_os = "macos")]
        dirs.push(home.join("Library/Arduino15"));
    }
    dirs.push(PathBuf::from("/usr/share/arduino/hardware"));
    dirs.push(PathBuf::from("/usr/local/share/arduino/hardware"));
    dirs
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fqbn_parses_triple_and_options() {
        let plain = Fqbn::parse("arduino:avr:uno").unwrap();
        assert_eq!(plain.vendor, "arduino");
        assert_eq!(plain.arch, "avr");
        assert_eq!(plain.board, "uno");
        assert!(plain.options.is_empty());

        let tail = Fqbn::parse("arduino:avr:nano:cpu=atmega328old,mem=big").unwrap();
        assert_eq!(
            tail.options,
            vec![
                ("cpu".to_owned(), "atmega328old".to_owned()),
                ("mem".to_owned(), "big".to_owned())
            ]
        );
        assert_eq!(tail.to_string(), "arduino:avr:nano:cpu=atmega328old,mem=big");
    }

    #[test]
    fn fqbn_rejects_malformed() {
        assert!(Fqbn::parse("arduino:avr").is_err());
        assert!(Fqbn::parse("arduino::uno").is_err());
        assert!(Fqbn::parse("arduino:avr:uno:cpu").is_err());
        assert!(Fqbn::parse("a:b:c:d:e").is_err());
    }

    fn fake_platform(tmp: &Path) -> PathBuf {
        let root = tmp.join("vendorx").join("samd");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("platform.txt"),
            "name=VendorX SAMD\ncompiler.path={runtime.tools.gcc.path}/bin/\n",
        )
        .unwrap();
        std::fs::write(
            root.join("boards.txt"),
            "menu.cpu=Processor\n\
             zero.name=VendorX Zero\n\
             zero.build.mcu=cortex-m0plus\n\
             zero.menu.cpu.fast.build.f_cpu=48000000L\n\
             zero.menu.cpu.slow.build.f_cpu=8000000L\n",
        )
        .unwrap();
        tmp.to_owned()
    }

    #[test]
    fn finds_ide_style_platform_and_board() {
        let tmp = TempDir::new().unwrap();
        let hw = fake_platform(tmp.path());
        let platform = find_platform(&[hw], "vendorx", "samd").unwrap();
        assert_eq!(platform.props.get("name"), Some("VendorX SAMD"));

        let fqbn = Fqbn::parse("vendorx:samd:zero:cpu=slow").unwrap();
        let board = platform.board_properties(&fqbn).unwrap();
        assert_eq!(board.get("build.mcu"), Some("cortex-m0plus"));
        // The FQBN tail selected the slow menu entry.
        assert_eq!(board.get("build.f_cpu"), Some("8000000L"));
        // menu.* definitions never leak into board properties.
        assert!(board.get("menu.cpu.fast.build.f_cpu").is_none());
    }

    #[test]
    fn unknown_board_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let hw = fake_platform(tmp.path());
        let platform = find_platform(&[hw], "vendorx", "samd").unwrap();
        let fqbn = Fqbn::parse("vendorx:samd:nope").unwrap();
        assert!(matches!(
            platform.board_properties(&fqbn),
            Err(BuildError::UnknownBoard { .. })
        ));
    }

    #[test]
    fn packaged_layout_picks_latest_version() {
        let tmp = TempDir::new().unwrap();
        for version in ["1.8.2", "1.10.0"] {
            let root = tmp
                .path()
                .join("packages/arduino/hardware/avr")
                .join(version);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("boards.txt"), format!("uno.name=Uno {}\n", version))
                .unwrap();
        }
        let platform = find_platform(&[tmp.path().to_owned()], "arduino", "avr").unwrap();
        assert_eq!(platform.version, "1.10.0");
        assert_eq!(platform.boards.get("uno.name"), Some("Uno 1.10.0"));
    }

    #[test]
    fn tool_properties_expose_latest() {
        let tmp = TempDir::new().unwrap();
        for version in ["5.4.0", "7.3.0"] {
            std::fs::create_dir_all(
                tmp.path()
                    .join("packages/arduino/tools/avr-gcc")
                    .join(version),
            )
            .unwrap();
        }
        let props = tool_properties(&[tmp.path().to_owned()]);
        let path = props.get("runtime.tools.avr-gcc.path").unwrap();
        assert!(path.ends_with("7.3.0"));
        assert!(props.get("runtime.tools.avr-gcc-5.4.0.path").is_some());
    }
}
