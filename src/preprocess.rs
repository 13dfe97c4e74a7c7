// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: preprocess  —  include discovery and sketch rewriting
//
//  The discovery loop repeatedly runs the platform's preprocess-only recipe
//  (recipe.preproc.macros) and feeds on its failures: every "No such file
//  or directory" diagnostic names a header, the resolver turns the header
//  into a concrete library, the library's include roots join the -I set and
//  its sources join the work queue, and the same source is retried.  The
//  imported set only ever grows, so the loop terminates.
//
//  Once every source preprocesses cleanly the merged sketch is rewritten
//  with the synthesized prototype block and #line mappings back to the
//  user's files.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{BuildError, Result};
use crate::library::LocationClass;
use crate::logger::BuildLogger;
use crate::props::PropertyMap;
use crate::prototypes;
use crate::recipe::RecipeRunner;
use crate::resolver::{LibraryResolver, Resolution};
use crate::sketch::Sketch;

const PREPROC_RECIPE: &str = "recipe.preproc.macros";

#[derive(Debug)]
pub struct PreprocessResult {
    /// The final merged+prototyped translation unit.
    pub sketch_cpp:      PathBuf,
    /// Include directories in discovery order (core, variant, sketch
    /// folder, then each imported library's roots).
    pub include_dirs:    Vec<PathBuf>,
    /// Imported library indexes into the resolver, in import order.
    pub imported:        Vec<usize>,
    pub prototype_count: usize,
    /// Text of the preprocessed merged sketch (for --verbose echo).
    pub preprocessed:    String,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Sketch,
    Library(usize),
}

pub fn preprocess(
    sketch: &Sketch,
    build_path: &Path,
    core_path: &Path,
    variant_path: Option<&Path>,
    runner: &RecipeRunner<'_>,
    resolver: &mut LibraryResolver,
    logger: &BuildLogger,
) -> Result<PreprocessResult> {
    let sketch_build_dir = build_path.join("sketch");
    std::fs::create_dir_all(&sketch_build_dir)?;
    let scratch_dir = build_path.join("preproc");
    std::fs::create_dir_all(&scratch_dir)?;
    let scratch_out = scratch_dir.join("preprocessed.cpp");

    // The discovery loop works on a scratch copy of the merged sketch; the
    // real translation unit is only (re)written at the end, and only when
    // its content changed, so untouched rebuilds keep their object cache.
    let sketch_cpp = sketch_build_dir.join(format!("{}.ino.cpp", sketch.name));
    let merged_scratch = scratch_dir.join(format!("{}.ino.cpp", sketch.name));
    let merged = sketch.merged_source()?;
    std::fs::write(&merged_scratch, &merged)?;

    let mut include_dirs: Vec<PathBuf> = vec![core_path.to_owned()];
    if let Some(variant) = variant_path {
        include_dirs.push(variant.to_owned());
    }
    include_dirs.push(sketch.folder.clone());

    let mut queue: VecDeque<(PathBuf, Origin)> = VecDeque::new();
    queue.push_back((merged_scratch.clone(), Origin::Sketch));
    for companion in &sketch.companion_sources {
        queue.push_back((companion.clone(), Origin::Sketch));
    }

    let mut imported: Vec<usize> = Vec::new();
    let mut imported_set: HashSet<usize> = HashSet::new();
    let mut queued_sources: HashSet<PathBuf> = queue.iter().map(|(p, _)| p.clone()).collect();
    let mut sketch_preprocessed = String::new();

    let missing_header = missing_header_regex();
    let include_context = Regex::new(r#"#include\s*[<"]([^">]+)[">]"#)
        .expect("include context pattern is valid");

    while let Some((source, origin)) = queue.pop_front() {
        loop {
            let overrides = preproc_overrides(&source, &scratch_out, &include_dirs);
            let outcome = runner
                .run(PREPROC_RECIPE, Some(&overrides), true)?
                .expect("required recipe always yields an outcome");

            if outcome.success() {
                let text = std::fs::read_to_string(&scratch_out).unwrap_or(outcome.stdout);
                if source == merged_scratch {
                    sketch_preprocessed = text.clone();
                }
                // Headers of already-imported libraries seen in the output
                // mean those libraries are in use: make sure their sources
                // are queued.
                for idx in libraries_seen(&text, resolver, &imported) {
                    for lib_source in resolver.library(idx).sources() {
                        if queued_sources.insert(lib_source.clone()) {
                            queue.push_back((lib_source, Origin::Library(idx)));
                        }
                    }
                }
                break;
            }

            let header = match extract_missing_header(&outcome.stderr, &missing_header, &include_context) {
                Some(h) => h,
                None => {
                    // Not an include problem: surface the diagnostic as-is.
                    return Err(BuildError::CompileFailed { output: outcome.stderr });
                }
            };

            let using_location = match origin {
                Origin::Sketch => LocationClass::User,
                Origin::Library(idx) => resolver.library(idx).location,
            };

            match resolver.resolve(&header, &imported_set, using_location) {
                Resolution::Chosen { index, warnings } => {
                    for w in warnings {
                        logger.warn(&w);
                    }
                    if !imported_set.insert(index) {
                        // The provider is already imported and its include
                        // roots are on the command line, yet the compiler
                        // still cannot find the header: give up with the
                        // real diagnostic instead of spinning.
                        return Err(unresolved(&header, &outcome.stderr, resolver, &imported));
                    }
                    imported.push(index);
                    let lib = resolver.library(index);
                    logger.detail(&format!(
                        "Using library {} at {}",
                        lib.name,
                        lib.root.display()
                    ));
                    include_dirs.extend(lib.include_dirs());
                    for lib_source in lib.sources() {
                        if queued_sources.insert(lib_source.clone()) {
                            queue.push_back((lib_source, Origin::Library(index)));
                        }
                    }
                    // Retry the same source with the widened include set.
                }
                Resolution::NotFound => {
                    return Err(unresolved(&header, &outcome.stderr, resolver, &imported));
                }
                Resolution::Conflict(candidates) => {
                    let listing: Vec<String> = candidates
                        .iter()
                        .map(|&i| {
                            let lib = resolver.library(i);
                            format!("  - {} ({})", lib.folder_name(), lib.root.display())
                        })
                        .collect();
                    return Err(BuildError::AmbiguousInclude {
                        header,
                        candidates: listing.join("\n"),
                    });
                }
            }
        }
    }

    // Prototype synthesis against the preprocessed merged sketch.
    let original_main = std::fs::read_to_string(&sketch.main_unit)?;
    let main_path = sketch.main_unit.to_string_lossy().into_owned();
    let report = prototypes::analyze(
        &sketch_preprocessed,
        &original_main,
        &main_path,
        &sketch.unit_paths(),
    );
    let final_text = insert_prototypes(&merged, &report.block, report.insertion_line, &main_path, &original_main);
    write_if_changed(&sketch_cpp, &final_text)?;

    Ok(PreprocessResult {
        sketch_cpp,
        include_dirs,
        imported,
        prototype_count: report.prototypes.len(),
        preprocessed: final_text,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Skip the write when the content is already on disk, keeping the file's
/// mtime stable so downstream object caching stays warm.
fn write_if_changed(path: &Path, content: &str) -> std::io::Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            return Ok(());
        }
    }
    std::fs::write(path, content)
}

fn preproc_overrides(source: &Path, out: &Path, include_dirs: &[PathBuf]) -> PropertyMap {
    let mut overrides = PropertyMap::new();
    overrides.set("source_file", &source.to_string_lossy());
    overrides.set("preprocessed_file_path", &out.to_string_lossy());
    overrides.set("includes", &join_includes(include_dirs));
    overrides
}

/// `-I` flags, each quoted so paths with spaces survive argv splitting.
pub fn join_includes(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| format!("\"-I{}\"", d.display()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The §-grammar for a missing include, e.g.
/// `Blink.ino:3:10: fatal error: Servo.h: No such file or directory`.
fn missing_header_regex() -> Regex {
    Regex::new(r"^.*?:\d+:\d+:\s*(fatal )?error:\s*([^:]+?):\s*No such file or directory\s*$")
        .expect("missing header pattern is valid")
}

fn extract_missing_header(
    stderr: &str,
    missing: &Regex,
    include_context: &Regex,
) -> Option<String> {
    let mut found: Option<String> = None;
    for line in stderr.lines() {
        if let Some(caps) = missing.captures(line.trim_end()) {
            let raw = caps.get(2).map(|m| m.as_str().trim().to_owned())?;
            found = Some(raw);
            break;
        }
    }
    let raw = found?;
    // Prefer the `#include <...>` context line when the compiler printed
    // one: it carries the exact spelling, without any path prefix.
    for line in stderr.lines() {
        if let Some(caps) = include_context.captures(line) {
            let spelled = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if basename(spelled) == basename(&raw) {
                return Some(basename(spelled).to_owned());
            }
        }
    }
    Some(basename(&raw).to_owned())
}

fn basename(s: &str) -> &str {
    s.rsplit(['/', '\\']).next().unwrap_or(s)
}

/// Library indexes whose include roots contain a file named by a `#line`
/// directive in the preprocessed output.
fn libraries_seen(text: &str, resolver: &LibraryResolver, imported: &[usize]) -> Vec<usize> {
    let mut seen: Vec<usize> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            continue;
        }
        let Some(file) = prototypes::line_directive_file(trimmed) else {
            continue;
        };
        let path = Path::new(file);
        for &idx in imported {
            if seen.contains(&idx) {
                continue;
            }
            let lib = resolver.library(idx);
            if lib.include_dirs().iter().any(|root| path.starts_with(root)) {
                seen.push(idx);
            }
        }
    }
    seen
}

fn unresolved(
    header: &str,
    stderr: &str,
    resolver: &LibraryResolver,
    imported: &[usize],
) -> BuildError {
    let used = if imported.is_empty() {
        "  (none)".to_owned()
    } else {
        imported
            .iter()
            .map(|&i| {
                let lib = resolver.library(i);
                format!("  {} {} at {}", lib.name, lib.version, lib.root.display())
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    BuildError::UnresolvedInclude {
        header:     header.to_owned(),
        diagnostic: stderr.trim_end().to_owned(),
        used,
    }
}

/// Splice the prototype block into the merged text right before the
/// original main-unit line `insertion_line`, restoring the mapping with a
/// trailing `#line` directive.
fn insert_prototypes(
    merged: &str,
    block: &str,
    insertion_line: usize,
    main_path: &str,
    original_main: &str,
) -> String {
    if block.is_empty() {
        return merged.to_owned();
    }
    // Merged layout: [optional Arduino.h include] + `#line 1 "main"` + main
    // unit body + further units.  The main unit's line N is therefore at
    // merged index (prefix + N - 1).
    let lines: Vec<&str> = merged.lines().collect();
    let main_marker = format!("#line 1 \"{}\"", main_path);
    let prefix = lines
        .iter()
        .position(|l| l.trim_end() == main_marker)
        .map(|i| i + 1)
        .unwrap_or(0);
    let main_len = original_main.lines().count();
    let at = (prefix + insertion_line.saturating_sub(1)).min(prefix + main_len).min(lines.len());

    let mut out = String::new();
    for line in &lines[..at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(block);
    if !block.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("#line {} \"{}\"\n", insertion_line, main_path));
    for line in &lines[at..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_matches_gcc_and_clang_shapes() {
        let missing = missing_header_regex();
        let ctx = Regex::new(r#"#include\s*[<"]([^">]+)[">]"#).unwrap();

        let gcc = "Blink.ino:2:10: fatal error: Servo.h: No such file or directory\ncompilation terminated.\n";
        assert_eq!(extract_missing_header(gcc, &missing, &ctx).as_deref(), Some("Servo.h"));

        let plain = "/tmp/x.cpp:14:3: error: SPI.h: No such file or directory\n";
        assert_eq!(extract_missing_header(plain, &missing, &ctx).as_deref(), Some("SPI.h"));

        let with_context = "\
/tmp/m.cpp:1:10: fatal error: sub/Radio.h: No such file or directory\n\
    1 | #include <sub/Radio.h>\n\
      |          ^~~~~~~~~~~~~\n";
        assert_eq!(
            extract_missing_header(with_context, &missing, &ctx).as_deref(),
            Some("Radio.h")
        );

        let unrelated = "m.cpp:3:1: error: expected ';' before 'void'\n";
        assert_eq!(extract_missing_header(unrelated, &missing, &ctx), None);
    }

    #[test]
    fn include_join_quotes_every_dir() {
        let joined = join_includes(&[PathBuf::from("/a"), PathBuf::from("/with space")]);
        assert_eq!(joined, "\"-I/a\" \"-I/with space\"");
    }

    #[test]
    fn prototype_block_lands_before_first_code_line() {
        let original = "#include <Arduino.h>\nint led = 13;\nvoid setup(){}\n";
        let merged = format!("#line 1 \"/s/B/B.ino\"\n{}", original);
        let block = "#line 1 \"/s/B/B.ino\"\nvoid setup();\n";
        let out = insert_prototypes(&merged, block, 2, "/s/B/B.ino", original);

        let lines: Vec<&str> = out.lines().collect();
        // Directive, include, block (2 lines), remap, then user code.
        assert_eq!(lines[0], "#line 1 \"/s/B/B.ino\"");
        assert_eq!(lines[1], "#include <Arduino.h>");
        assert_eq!(lines[2], "#line 1 \"/s/B/B.ino\"");
        assert_eq!(lines[3], "void setup();");
        assert_eq!(lines[4], "#line 2 \"/s/B/B.ino\"");
        assert_eq!(lines[5], "int led = 13;");
    }

    #[test]
    fn empty_block_leaves_merged_untouched() {
        let merged = "#line 1 \"/s/B/B.ino\"\nvoid setup(){}\n";
        assert_eq!(insert_prototypes(merged, "", 1, "/s/B/B.ino", "void setup(){}\n"), merged);
    }

    // The full discovery loop, driven by a fake preprocessor script.
    #[cfg(unix)]
    mod discovery {
        use super::*;
        use crate::cancel::CancelToken;
        use crate::library::{scan_libraries, LocationClass};
        use crate::sketch::Sketch;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// A stand-in preprocessor: fails with the canonical diagnostic for
        /// any `#include <X.h>` whose header is not present under an -I dir,
        /// otherwise copies the source to the output path.
        const FAKE_PREPROC: &str = r#"#!/bin/sh
src="$1"; out="$2"; shift 2
for header in $(sed -n 's/^#include <\(.*\)>.*$/\1/p' "$src"); do
    found=no
    for flag in "$@"; do
        dir="${flag#-I}"
        [ -f "$dir/$header" ] && found=yes
    done
    [ "$header" = "Arduino.h" ] && found=yes
    if [ "$found" = "no" ]; then
        echo "$src:1:10: fatal error: $header: No such file or directory" >&2
        exit 1
    fi
done
cp "$src" "$out"
"#;

        struct Fixture {
            _tmp:  TempDir,
            props: PropertyMap,
            sketch: Sketch,
            build: PathBuf,
            core:  PathBuf,
            libs:  PathBuf,
        }

        fn fixture(sketch_body: &str) -> Fixture {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path();

            let tool = root.join("fake-preproc.sh");
            std::fs::write(&tool, FAKE_PREPROC).unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

            let sketch_dir = root.join("Blink");
            std::fs::create_dir_all(&sketch_dir).unwrap();
            std::fs::write(sketch_dir.join("Blink.ino"), sketch_body).unwrap();

            let core = root.join("core");
            std::fs::create_dir_all(&core).unwrap();
            let libs = root.join("libraries");
            std::fs::create_dir_all(&libs).unwrap();
            let build = root.join("build");
            std::fs::create_dir_all(&build).unwrap();

            let mut props = PropertyMap::new();
            props.set(
                "recipe.preproc.macros",
                &format!(
                    "\"{}\" \"{{source_file}}\" \"{{preprocessed_file_path}}\" {{includes}}",
                    tool.display()
                ),
            );

            Fixture {
                sketch: Sketch::load(&sketch_dir).unwrap(),
                _tmp: tmp,
                props,
                build,
                core,
                libs,
            }
        }

        fn add_library(libs_root: &Path, name: &str, headers: &[&str]) {
            let dir = libs_root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for h in headers {
                std::fs::write(dir.join(h), "#pragma once\n").unwrap();
            }
            std::fs::write(dir.join(format!("{}.cpp", name)), "// impl\n").unwrap();
        }

        #[test]
        fn discovers_library_and_injects_prototypes() {
            let fx = fixture("#include <Radio.h>\nvoid setup(){}\nvoid loop(){}\n");
            add_library(&fx.libs, "Radio", &["Radio.h"]);

            let libraries =
                scan_libraries(&[(fx.libs.clone(), LocationClass::User)]);
            let mut resolver = crate::resolver::LibraryResolver::new(libraries, "avr");
            let logger = BuildLogger::default();
            let runner = RecipeRunner::new(&fx.props, logger, CancelToken::new());

            let result = preprocess(
                &fx.sketch, &fx.build, &fx.core, None, &runner, &mut resolver, &logger,
            )
            .unwrap();

            assert_eq!(result.imported.len(), 1);
            assert_eq!(resolver.library(result.imported[0]).name, "Radio");
            assert!(result
                .include_dirs
                .iter()
                .any(|d| d.ends_with("libraries/Radio")));

            let text = std::fs::read_to_string(&result.sketch_cpp).unwrap();
            assert!(text.starts_with("#include <Arduino.h>\n"));
            assert!(text.contains("void setup();\nvoid loop();\n"));
            assert_eq!(result.prototype_count, 2);
        }

        #[test]
        fn unresolved_include_reports_header_and_used_list() {
            let fx = fixture("#include <NoSuchLib.h>\nvoid setup(){}\nvoid loop(){}\n");
            let mut resolver = crate::resolver::LibraryResolver::new(Vec::new(), "avr");
            let logger = BuildLogger::default();
            let runner = RecipeRunner::new(&fx.props, logger, CancelToken::new());

            let err = preprocess(
                &fx.sketch, &fx.build, &fx.core, None, &runner, &mut resolver, &logger,
            )
            .unwrap_err();
            match err {
                BuildError::UnresolvedInclude { header, diagnostic, .. } => {
                    assert_eq!(header, "NoSuchLib.h");
                    assert!(diagnostic.contains("NoSuchLib.h: No such file or directory"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn library_sources_are_preprocessed_too() {
            // Radio.cpp includes Clock.h, provided by a second library that
            // only becomes visible through the discovery loop.
            let fx = fixture("#include <Radio.h>\nvoid setup(){}\nvoid loop(){}\n");
            add_library(&fx.libs, "Clock", &["Clock.h"]);
            let radio = fx.libs.join("Radio");
            std::fs::create_dir_all(&radio).unwrap();
            std::fs::write(radio.join("Radio.h"), "#pragma once\n").unwrap();
            std::fs::write(radio.join("Radio.cpp"), "#include <Clock.h>\n").unwrap();

            let libraries =
                scan_libraries(&[(fx.libs.clone(), LocationClass::User)]);
            let mut resolver = crate::resolver::LibraryResolver::new(libraries, "avr");
            let logger = BuildLogger::default();
            let runner = RecipeRunner::new(&fx.props, logger, CancelToken::new());

            let result = preprocess(
                &fx.sketch, &fx.build, &fx.core, None, &runner, &mut resolver, &logger,
            )
            .unwrap();

            let names: Vec<&str> = result
                .imported
                .iter()
                .map(|&i| resolver.library(i).name.as_str())
                .collect();
            assert_eq!(names, vec!["Radio", "Clock"], "import order follows discovery");
        }
    }
}
