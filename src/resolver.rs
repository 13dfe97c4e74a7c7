// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: resolver  —  include-to-library resolution
//
//  Given an unsatisfied `#include <H.h>`, pick one installed library among
//  all that provide H.h.  The rank chain, applied in order with the first
//  discriminating step winning:
//
//    a. location class equal to the using unit's own location class
//    b. folder basename equal to H (case-sensitive)
//    c. target architecture declared explicitly (not just `*`)
//    d. lexicographic (location ordinal, folder name)
//
//  Step (d) is only a tiebreaker: when none of (a)-(c) and the architecture
//  filter discriminated at all, the include is ambiguous and the build must
//  fail with the full candidate list.  Decisions are cached per
//  (header, using-location) so an include resolves identically for the
//  whole build.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::library::{Library, LocationClass};

/// Per-sketch preference file: `{ "header.h": "LibraryName" }`.
const PREFERENCES_FILE: &str = "hotaru.resolve.json";

#[derive(Debug)]
pub enum Resolution {
    Chosen {
        index:    usize,
        warnings: Vec<String>,
    },
    NotFound,
    /// Candidate indexes in rank order.
    Conflict(Vec<usize>),
}

pub struct LibraryResolver {
    pub libraries: Vec<Library>,
    target_arch:   String,
    preferences:   HashMap<String, String>,
    cache:         HashMap<(String, LocationClass), usize>,
}

impl LibraryResolver {
    pub fn new(libraries: Vec<Library>, target_arch: &str) -> Self {
        LibraryResolver {
            libraries,
            target_arch: target_arch.to_owned(),
            preferences: HashMap::new(),
            cache:       HashMap::new(),
        }
    }

    /// Load the per-sketch preference map, ignoring a missing or broken file.
    pub fn load_preferences(&mut self, sketch_folder: &Path) {
        let path = sketch_folder.join(PREFERENCES_FILE);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(&text) {
                self.preferences = map;
            }
        }
    }

    pub fn library(&self, index: usize) -> &Library {
        &self.libraries[index]
    }

    pub fn resolve(
        &mut self,
        header: &str,
        imported: &HashSet<usize>,
        using_location: LocationClass,
    ) -> Resolution {
        // Already-imported providers win outright.
        for &idx in imported {
            if self.libraries[idx].provides_header(header) {
                return Resolution::Chosen { index: idx, warnings: Vec::new() };
            }
        }

        let cache_key = (header.to_owned(), using_location);
        if let Some(&idx) = self.cache.get(&cache_key) {
            return Resolution::Chosen { index: idx, warnings: Vec::new() };
        }

        let all: Vec<usize> = (0..self.libraries.len())
            .filter(|&i| self.libraries[i].provides_header(header))
            .collect();
        if all.is_empty() {
            return Resolution::NotFound;
        }

        let mut warnings: Vec<String> = Vec::new();
        let mut narrowed = false;

        // Architecture filter: incompatible candidates are dropped only when
        // a compatible one exists; otherwise selection proceeds with a
        // warning attached.
        let compatible: Vec<usize> = all
            .iter()
            .copied()
            .filter(|&i| self.libraries[i].supports_arch(&self.target_arch))
            .collect();
        let mut arch_warning = false;
        let mut current = if compatible.is_empty() {
            arch_warning = true;
            all.clone()
        } else {
            if compatible.len() < all.len() {
                narrowed = true;
            }
            compatible
        };

        // Explicit user preference forces the choice when it is a candidate.
        if let Some(wanted) = self.preferences.get(header).cloned() {
            if let Some(&idx) = current.iter().find(|&&i| self.libraries[i].name == wanted) {
                return self.commit(cache_key, idx, arch_warning, warnings);
            }
        }

        if current.len() == 1 {
            return self.commit(cache_key, current[0], arch_warning, warnings);
        }

        for rank in [RankStep::Location, RankStep::NameAffinity, RankStep::ArchSpecific] {
            let subset: Vec<usize> = current
                .iter()
                .copied()
                .filter(|&i| self.rank_matches(rank, i, header, using_location))
                .collect();
            if subset.is_empty() || subset.len() == current.len() {
                continue;
            }
            narrowed = true;
            current = subset;
            if current.len() == 1 {
                return self.commit(cache_key, current[0], arch_warning, warnings);
            }
        }

        // ≥2 equally ranked candidates remain.
        current.sort_by(|&a, &b| {
            let ka = (self.libraries[a].location.ordinal(), self.libraries[a].folder_name());
            let kb = (self.libraries[b].location.ordinal(), self.libraries[b].folder_name());
            ka.cmp(&kb)
        });
        if !narrowed {
            return Resolution::Conflict(current);
        }

        let chosen = current[0];
        let rejected: Vec<String> = current[1..]
            .iter()
            .map(|&i| self.libraries[i].root.display().to_string())
            .collect();
        warnings.push(format!(
            "Multiple libraries were found for \"{}\"\n  Used: {}\n  Not used: {}",
            header,
            self.libraries[chosen].root.display(),
            rejected.join("\n  Not used: "),
        ));
        self.commit(cache_key, chosen, arch_warning, warnings)
    }

    fn rank_matches(
        &self,
        step: RankStep,
        index: usize,
        header: &str,
        using_location: LocationClass,
    ) -> bool {
        let lib = &self.libraries[index];
        match step {
            RankStep::Location => lib.location == using_location,
            // Folder basename equals the header name without its suffix,
            // compared case-sensitively.
            RankStep::NameAffinity => {
                let stem = header
                    .strip_suffix(".h")
                    .or_else(|| header.strip_suffix(".hpp"))
                    .unwrap_or(header);
                lib.folder_name() == stem
            }
            RankStep::ArchSpecific => lib.declares_arch(&self.target_arch),
        }
    }

    fn commit(
        &mut self,
        key: (String, LocationClass),
        index: usize,
        arch_warning: bool,
        mut warnings: Vec<String>,
    ) -> Resolution {
        if arch_warning {
            let lib = &self.libraries[index];
            warnings.push(format!(
                "library {} claims to run on {} architecture(s) and may be incompatible with your current board which runs on {}",
                lib.name,
                lib.architectures.join(", "),
                self.target_arch,
            ));
        }
        self.cache.insert(key, index);
        Resolution::Chosen { index, warnings }
    }
}

#[derive(Debug, Clone, Copy)]
enum RankStep {
    Location,
    NameAffinity,
    ArchSpecific,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
