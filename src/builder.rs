// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: builder  —  build orchestration
//
//  Phase order, each phase bracketed by its named hooks (pre-hooks are
//  fatal, post-hooks warn and continue):
//
//    prebuild → preprocess → sketch → libraries → core → link → objcopy
//    → bootloader merge → size → postbuild → compile_commands.json
//
//  The compilation database is written even when a phase fails, so editors
//  keep an indexable command set.  Within a phase, units compile on a rayon
//  pool bounded by --jobs; phase boundaries and hooks are serialization
//  points.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::cache::{hash_str, CachedUnit};
use crate::cancel::CancelToken;
use crate::compiledb::CompilationDatabase;
use crate::error::{BuildError, Result};
use crate::library::LocationClass;
use crate::logger::BuildLogger;
use crate::options::BuildOptions;
use crate::platform::{find_platform, tool_properties, Fqbn, Platform};
use crate::preprocess::{join_includes, preprocess};
use crate::props::PropertyMap;
use crate::recipe::RecipeRunner;
use crate::resolver::LibraryResolver;
use crate::sketch::Sketch;

const CORE_SENTINEL: &str = ".core_sig";

// ─────────────────────────────────────────────────────────────────────────────
//  Inputs and results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub sketch_path:              PathBuf,
    pub fqbn:                     String,
    pub build_path:               PathBuf,
    pub hardware_dirs:            Vec<PathBuf>,
    pub tools_dirs:               Vec<PathBuf>,
    pub builtin_libraries_dirs:   Vec<PathBuf>,
    pub user_libraries_dir:       Option<PathBuf>,
    pub unmanaged_libraries_dirs: Vec<PathBuf>,
    /// `key=value` overrides from the command line, merged last.
    pub build_properties:         Vec<String>,
    pub optimize_for_debug:       bool,
    pub jobs:                     usize,
    pub clean:                    bool,
    pub only_compilation_database: bool,
}

#[derive(Debug, Default)]
pub struct BuildSummary {
    pub elf:             Option<PathBuf>,
    /// (name, version, root) per imported library, import order.
    pub used_libraries:  Vec<(String, String, PathBuf)>,
    pub prototype_count: usize,
}

pub struct Builder {
    inputs: BuildInputs,
    logger: BuildLogger,
    cancel: CancelToken,
}

impl Builder {
    pub fn new(inputs: BuildInputs, logger: BuildLogger, cancel: CancelToken) -> Self {
        Builder { inputs, logger, cancel }
    }

    pub fn run(&self) -> Result<BuildSummary> {
        let sketch = Sketch::load(&self.inputs.sketch_path)?;
        let fqbn = Fqbn::parse(&self.inputs.fqbn)?;

        std::fs::create_dir_all(&self.inputs.build_path)?;
        let build_path = self.inputs.build_path.canonicalize()?;
        if build_path.starts_with(&sketch.folder) {
            return Err(BuildError::BuildPathInsideSketch(build_path));
        }

        let target = find_platform(&self.inputs.hardware_dirs, &fqbn.vendor, &fqbn.arch)?;
        let (props, actual) = self.assemble_properties(&sketch, &fqbn, &target, &build_path)?;

        // Gatekeeper: wipe the build tree when any cache-invalidating input
        // changed since the last build.
        self.build_options(&sketch, &fqbn, &target, &props)
            .enforce(&build_path, self.inputs.clean, &self.logger)?;

        let resolver = self.load_resolver(&sketch, &fqbn, &target, actual.as_ref());
        let compiledb = CompilationDatabase::new(&build_path.join("compile_commands.json"));

        let mut summary = BuildSummary::default();
        let outcome = self.run_phases(
            &sketch,
            &build_path,
            &props,
            resolver,
            &compiledb,
            &mut summary,
        );

        // The database is written even when the build failed.
        if let Err(e) = compiledb.save() {
            self.logger.warn(&format!("Could not write compile_commands.json: {}", e));
        }
        self.print_used_libraries(&summary);

        outcome.map(|_| summary)
    }

    // ── Property assembly ─────────────────────────────────────────────────────

    fn assemble_properties(
        &self,
        sketch: &Sketch,
        fqbn: &Fqbn,
        target: &Platform,
        build_path: &Path,
    ) -> Result<(PropertyMap, Option<Platform>)> {
        let mut props = target.props.clone();
        props.merge(&target.board_properties(fqbn)?);
        props.merge(&tool_properties(&self.inputs.tools_dirs));

        // A board may pull its core (and variant) from another vendor's
        // platform: `build.core=vendor:core`.
        let core_ref = props.get("build.core").unwrap_or("arduino").to_owned();
        let (core_platform, core_name) = match core_ref.split_once(':') {
            Some((vendor, core)) => {
                let referenced = find_platform(&self.inputs.hardware_dirs, vendor, &fqbn.arch)?;
                (Some(referenced), core.to_owned())
            }
            None => (None, core_ref),
        };
        let core_root = core_platform.as_ref().unwrap_or(target).root.clone();

        let variant_ref = props.get("build.variant").unwrap_or("").to_owned();
        let (variant_root, variant_name) = match variant_ref.split_once(':') {
            Some((vendor, variant)) => {
                let referenced = find_platform(&self.inputs.hardware_dirs, vendor, &fqbn.arch)?;
                (referenced.root, variant.to_owned())
            }
            None => (core_root.clone(), variant_ref),
        };

        props.set("build.core.path", &core_root.join("cores").join(&core_name).to_string_lossy());
        if !variant_name.is_empty() {
            props.set(
                "build.variant.path",
                &variant_root.join("variants").join(&variant_name).to_string_lossy(),
            );
        }
        props.set("build.system.path", &target.root.join("system").to_string_lossy());
        props.set("runtime.platform.path", &target.root.to_string_lossy());
        if let Some(vendor_dir) = target.root.parent() {
            props.set("runtime.hardware.path", &vendor_dir.to_string_lossy());
        }
        props.set("runtime.ide.version", "10607");
        props.set("build.fqbn", &fqbn.to_string());
        props.set("build.arch", &fqbn.arch.to_uppercase());
        props.set("build.path", &build_path.to_string_lossy());
        props.set(
            "build.project_name",
            &sketch
                .main_unit
                .file_name()
                .unwrap_or_default()
                .to_string_lossy(),
        );
        props.set("build.source.path", &sketch.folder.to_string_lossy());

        // Optimization profile swap.
        let profile_key = if self.inputs.optimize_for_debug {
            "compiler.optimization_flags.debug"
        } else {
            "compiler.optimization_flags.release"
        };
        if let Some(flags) = props.get(profile_key).map(str::to_owned) {
            props.set("compiler.optimization_flags", &flags);
        }

        // Platforms ship warning levels as compiler.warning_flags.<level>;
        // default to the quiet one when nothing selected a level.
        if !props.contains_key("compiler.warning_flags") {
            if let Some(flags) = props.get("compiler.warning_flags.none").map(str::to_owned) {
                props.set("compiler.warning_flags", &flags);
            }
        }

        if !props.contains_key("build.warn_data_percentage") {
            props.set("build.warn_data_percentage", "75");
        }

        // User overrides win over everything.
        for pair in &self.inputs.build_properties {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| BuildError::InvalidBuildProperty(pair.clone()))?;
            if k.trim().is_empty() {
                return Err(BuildError::InvalidBuildProperty(pair.clone()));
            }
            props.set(k.trim(), v);
        }

        Ok((props, core_platform))
    }

    fn build_options(
        &self,
        sketch: &Sketch,
        fqbn: &Fqbn,
        target: &Platform,
        props: &PropertyMap,
    ) -> BuildOptions {
        let path_strings = |dirs: &[PathBuf]| -> Vec<String> {
            dirs.iter().map(|p| p.display().to_string()).collect()
        };
        let mut custom = self.inputs.build_properties.clone();
        custom.sort();
        BuildOptions {
            hardware_dirs:           path_strings(&self.inputs.hardware_dirs),
            builtin_tools_dirs:      path_strings(&self.inputs.tools_dirs),
            builtin_libraries_dirs:  path_strings(&self.inputs.builtin_libraries_dirs),
            other_libraries_dirs:    path_strings(&self.inputs.unmanaged_libraries_dirs),
            sketch_location:         sketch.folder.display().to_string(),
            fqbn:                    fqbn.to_string(),
            custom_build_properties: custom,
            compiler_optimization_flags: props
                .get("compiler.optimization_flags")
                .unwrap_or("")
                .to_owned(),
            platform: format!("{}:{}@{}", target.vendor, target.arch, target.version),
        }
    }

    fn load_resolver(
        &self,
        sketch: &Sketch,
        fqbn: &Fqbn,
        target: &Platform,
        referenced: Option<&Platform>,
    ) -> LibraryResolver {
        let mut roots: Vec<(PathBuf, LocationClass)> = Vec::new();
        for dir in &self.inputs.builtin_libraries_dirs {
            roots.push((dir.clone(), LocationClass::IdeBuiltin));
        }
        if let Some(dir) = target.libraries_dir() {
            roots.push((dir, LocationClass::PlatformBuiltin));
        }
        if let Some(platform) = referenced {
            if let Some(dir) = platform.libraries_dir() {
                roots.push((dir, LocationClass::ReferencedPlatformBuiltin));
            }
        }
        if let Some(dir) = &self.inputs.user_libraries_dir {
            roots.push((dir.clone(), LocationClass::User));
        }
        for dir in &self.inputs.unmanaged_libraries_dirs {
            roots.push((dir.clone(), LocationClass::Unmanaged));
        }
        let libraries = crate::library::scan_libraries(&roots);
        let mut resolver = LibraryResolver::new(libraries, &fqbn.arch);
        resolver.load_preferences(&sketch.folder);
        resolver
    }

    // ── Phases ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &self,
        sketch: &Sketch,
        build_path: &Path,
        props: &PropertyMap,
        mut resolver: LibraryResolver,
        compiledb: &CompilationDatabase,
        summary: &mut BuildSummary,
    ) -> Result<()> {
        let runner = RecipeRunner::new(props, self.logger, self.cancel.clone());
        let arch = props.get("build.arch").unwrap_or("").to_lowercase();

        self.run_hooks(&runner, props, "prebuild", true)?;

        // Preprocess: include discovery + prototype injection.
        self.logger.info("Detecting libraries used...");
        let core_path = PathBuf::from(props.get("build.core.path").unwrap_or_default());
        let variant_path = props.get("build.variant.path").map(PathBuf::from);
        let pre = preprocess(
            sketch,
            build_path,
            &core_path,
            variant_path.as_deref(),
            &runner,
            &mut resolver,
            &self.logger,
        )?;
        summary.prototype_count = pre.prototype_count;
        for &idx in &pre.imported {
            let lib = resolver.library(idx);
            summary
                .used_libraries
                .push((lib.name.clone(), lib.version.clone(), lib.root.clone()));
            if !lib.supports_arch(&arch) {
                self.logger.warn(&format!(
                    "library {} claims to run on {} architecture(s) and may be incompatible with your current board which runs on {}",
                    lib.name,
                    lib.architectures.join(", "),
                    arch,
                ));
            }
        }
        if self.logger.verbose {
            self.logger.info(&pre.preprocessed);
        }

        let includes = join_includes(&pre.include_dirs);
        let jobs = self.effective_jobs();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        // ── Sketch ────────────────────────────────────────────────────────────
        self.logger.info("Compiling sketch...");
        self.run_hooks(&runner, props, "sketch.prebuild", true)?;
        let sketch_build_dir = build_path.join("sketch");
        let mut sketch_units: Vec<(PathBuf, PathBuf)> = vec![(
            pre.sketch_cpp.clone(),
            sketch_build_dir.join(object_name(&pre.sketch_cpp, &sketch_build_dir)),
        )];
        for companion in &sketch.companion_sources {
            sketch_units.push((
                companion.clone(),
                sketch_build_dir.join(object_name(companion, &sketch.folder)),
            ));
        }
        let sketch_objects = self.compile_batch(
            &pool, &runner, &sketch_units, &includes, &pre.include_dirs, build_path, compiledb,
        )?;
        self.run_hooks(&runner, props, "sketch.postbuild", false)?;

        // ── Libraries ─────────────────────────────────────────────────────────
        self.logger.info("Compiling libraries...");
        self.run_hooks(&runner, props, "libraries.prebuild", true)?;
        let libraries_build_dir = build_path.join("libraries");
        std::fs::create_dir_all(&libraries_build_dir)?;
        let imported_names: HashSet<String> = pre
            .imported
            .iter()
            .map(|&i| resolver.library(i).name.clone())
            .collect();
        remove_unused_compiled_libraries(&libraries_build_dir, &imported_names)?;

        let mut library_objects: Vec<PathBuf> = Vec::new();
        for &idx in &pre.imported {
            let lib = resolver.library(idx);
            self.logger.detail(&format!("Compiling library \"{}\"", lib.name));
            let lib_build_dir = libraries_build_dir.join(&lib.name);
            let units: Vec<(PathBuf, PathBuf)> = lib
                .sources()
                .iter()
                .map(|src| (src.clone(), lib_build_dir.join(object_name(src, &lib.root))))
                .collect();
            library_objects.extend(self.compile_batch(
                &pool, &runner, &units, &includes, &pre.include_dirs, build_path, compiledb,
            )?);
        }
        self.run_hooks(&runner, props, "libraries.postbuild", false)?;

        // ── Core ──────────────────────────────────────────────────────────────
        self.logger.info("Compiling core...");
        self.run_hooks(&runner, props, "core.prebuild", true)?;
        let core_archive = self.build_core(
            &pool, &runner, props, &core_path, variant_path.as_deref(), build_path, &includes,
            &pre.include_dirs, compiledb,
        )?;
        self.run_hooks(&runner, props, "core.postbuild", false)?;

        if self.inputs.only_compilation_database {
            // Every argv is recorded; nothing to link.
            return Ok(());
        }

        // ── Link ──────────────────────────────────────────────────────────────
        self.logger.info("Linking everything together...");
        self.run_hooks(&runner, props, "linking.prelink", true)?;
        let mut objects: Vec<PathBuf> = sketch_objects;
        objects.extend(library_objects);
        self.link(&runner, &objects, &core_archive)?;
        self.run_hooks(&runner, props, "linking.postlink", false)?;

        // ── Objcopy ───────────────────────────────────────────────────────────
        self.run_hooks(&runner, props, "objcopy.preobjcopy", true)?;
        let mut variants = props.first_level_of("recipe.objcopy");
        variants.sort();
        for variant in variants {
            let key = format!("recipe.objcopy.{}.pattern", variant);
            if let Some(outcome) = runner.run(&key, None, false)? {
                if !outcome.success() {
                    return Err(BuildError::CompileFailed { output: outcome.stderr });
                }
            }
        }
        self.run_hooks(&runner, props, "objcopy.postobjcopy", false)?;

        merge_sketch_with_bootloader(props, build_path, &self.logger)?;
        self.report_size(&runner, props, &arch)?;
        self.run_hooks(&runner, props, "postbuild", false)?;

        let elf = build_path.join(format!(
            "{}.elf",
            props.get("build.project_name").unwrap_or_default()
        ));
        summary.elf = elf.is_file().then_some(elf);
        Ok(())
    }

    fn effective_jobs(&self) -> usize {
        if self.inputs.jobs > 0 {
            return self.inputs.jobs;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    // ── Compile substeps ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn compile_batch(
        &self,
        pool: &rayon::ThreadPool,
        runner: &RecipeRunner<'_>,
        units: &[(PathBuf, PathBuf)],
        includes: &str,
        include_dirs: &[PathBuf],
        build_path: &Path,
        compiledb: &CompilationDatabase,
    ) -> Result<Vec<PathBuf>> {
        let results: Vec<Result<PathBuf>> = pool.install(|| {
            units
                .par_iter()
                .map(|(source, object)| {
                    self.compile_unit(
                        runner, source, object, includes, include_dirs, build_path, compiledb,
                    )
                })
                .collect()
        });

        let mut objects = Vec::with_capacity(results.len());
        let mut failures: Vec<String> = Vec::new();
        for result in results {
            match result {
                Ok(obj) => objects.push(obj),
                Err(BuildError::Cancelled) => return Err(BuildError::Cancelled),
                Err(BuildError::CompileFailed { output }) => failures.push(output),
                Err(other) => return Err(other),
            }
        }
        if !failures.is_empty() {
            return Err(BuildError::CompileFailed { output: failures.join("\n\n") });
        }
        Ok(objects)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_unit(
        &self,
        runner: &RecipeRunner<'_>,
        source: &Path,
        object: &Path,
        includes: &str,
        include_dirs: &[PathBuf],
        build_path: &Path,
        compiledb: &CompilationDatabase,
    ) -> Result<PathBuf> {
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("");
        let recipe_key = match ext {
            "c" => "recipe.c.o.pattern",
            "S" => "recipe.S.o.pattern",
            _ => "recipe.cpp.o.pattern",
        };

        if let Some(parent) = object.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut overrides = PropertyMap::new();
        overrides.set("source_file", &source.to_string_lossy());
        overrides.set("object_file", &object.to_string_lossy());
        overrides.set("includes", includes);

        let argv = runner
            .argv_for(recipe_key, Some(&overrides), true)?
            .expect("required recipe always yields argv");
        compiledb.add(build_path, source, argv.clone());

        if self.inputs.only_compilation_database {
            return Ok(object.to_owned());
        }

        let unit = CachedUnit::new(source, object, &argv, include_dirs);
        if unit.is_fresh() {
            self.logger
                .detail(&format!("Using previously compiled file: {}", object.display()));
            return Ok(object.to_owned());
        }

        let outcome = runner.exec(argv)?;
        if !outcome.success() {
            return Err(BuildError::CompileFailed {
                output: format!("In {}:\n{}", source.display(), outcome.stderr),
            });
        }
        if self.logger.verbose {
            self.logger.passthrough(&outcome.stderr);
        }
        unit.record()?;
        Ok(object.to_owned())
    }

    /// Compile the core sources and archive them into core.a.  The archive
    /// step carries its own cross-build cache keyed on the core sources and
    /// the compile-relevant properties, so a platform update invalidates it
    /// while sketch edits do not.
    #[allow(clippy::too_many_arguments)]
    fn build_core(
        &self,
        pool: &rayon::ThreadPool,
        runner: &RecipeRunner<'_>,
        props: &PropertyMap,
        core_path: &Path,
        variant_path: Option<&Path>,
        build_path: &Path,
        includes: &str,
        include_dirs: &[PathBuf],
        compiledb: &CompilationDatabase,
    ) -> Result<PathBuf> {
        let core_build_dir = build_path.join("core");
        std::fs::create_dir_all(&core_build_dir)?;
        let archive = core_build_dir.join("core.a");

        let mut sources: Vec<PathBuf> = core_sources(core_path);
        if let Some(variant) = variant_path {
            sources.extend(core_sources(variant));
        }
        sources.sort();

        let units: Vec<(PathBuf, PathBuf)> = sources
            .iter()
            .map(|src| {
                let base = if src.starts_with(core_path) { core_path } else { src.parent().unwrap_or(core_path) };
                (src.clone(), core_build_dir.join(object_name(src, base)))
            })
            .collect();
        let objects = self.compile_batch(
            pool, runner, &units, includes, include_dirs, build_path, compiledb,
        )?;

        if self.inputs.only_compilation_database {
            return Ok(archive);
        }

        let signature = core_signature(&sources, props, includes);
        let sentinel = core_build_dir.join(CORE_SENTINEL);
        let cached = std::fs::read_to_string(&sentinel)
            .map(|s| s.trim() == signature)
            .unwrap_or(false);
        if cached && archive.is_file() {
            self.logger.detail("Using precompiled core");
            return Ok(archive);
        }

        if archive.is_file() {
            std::fs::remove_file(&archive)?;
        }
        for object in &objects {
            let mut overrides = PropertyMap::new();
            overrides.set("archive_file", "core/core.a");
            overrides.set("archive_file_path", &archive.to_string_lossy());
            overrides.set("object_file", &object.to_string_lossy());
            if let Some(outcome) = runner.run("recipe.ar.pattern", Some(&overrides), true)? {
                if !outcome.success() {
                    return Err(BuildError::CompileFailed { output: outcome.stderr });
                }
            }
        }
        std::fs::write(&sentinel, &signature)?;
        Ok(archive)
    }

    fn link(
        &self,
        runner: &RecipeRunner<'_>,
        objects: &[PathBuf],
        core_archive: &Path,
    ) -> Result<()> {
        let object_files = objects
            .iter()
            .map(|o| format!("\"{}\"", o.display()))
            .collect::<Vec<_>>()
            .join(" ");
        let mut overrides = PropertyMap::new();
        overrides.set("object_files", &object_files);
        overrides.set("archive_file", "core/core.a");
        overrides.set("archive_file_path", &core_archive.to_string_lossy());

        let outcome = runner
            .run("recipe.c.combine.pattern", Some(&overrides), true)?
            .expect("required recipe always yields an outcome");
        if !outcome.success() {
            self.logger.passthrough(&outcome.stderr);
            return Err(BuildError::LinkFailed { output: outcome.stderr });
        }
        Ok(())
    }

    // ── Hooks ─────────────────────────────────────────────────────────────────

    /// Run `recipe.hooks.<phase>.pattern` and every numbered
    /// `recipe.hooks.<phase>.<N>.pattern`, N ascending.  Pre-hooks are
    /// fatal on failure, post-hooks only warn.
    fn run_hooks(
        &self,
        runner: &RecipeRunner<'_>,
        props: &PropertyMap,
        phase: &str,
        fatal: bool,
    ) -> Result<()> {
        for key in hook_recipe_keys(props, phase) {
            let Some(outcome) = runner.run(&key, None, false)? else {
                continue;
            };
            if outcome.success() {
                continue;
            }
            if fatal {
                return Err(BuildError::HookFailed { recipe: key, output: outcome.stderr });
            }
            self.logger
                .warn(&format!("Hook '{}' failed:\n{}", key, outcome.stderr));
        }
        Ok(())
    }

    // ── Size report ───────────────────────────────────────────────────────────

    fn report_size(&self, runner: &RecipeRunner<'_>, props: &PropertyMap, arch: &str) -> Result<()> {
        let Some(outcome) = runner.run("recipe.size.pattern", None, false)? else {
            return Ok(());
        };
        if !outcome.success() {
            self.logger.warn("Couldn't determine program size");
            return Ok(());
        }

        let text = props
            .get_with_arch_fallback("recipe.size.regex", arch)
            .and_then(|re| sum_size_regex(re, &outcome.stdout));
        let data = props
            .get_with_arch_fallback("recipe.size.regex.data", arch)
            .and_then(|re| sum_size_regex(re, &outcome.stdout));

        let max_size = props.get("upload.maximum_size").and_then(|v| v.parse::<u64>().ok());
        let max_data = props
            .get("upload.maximum_data_size")
            .and_then(|v| v.parse::<u64>().ok());

        if let Some(text) = text {
            match max_size {
                Some(max) => {
                    self.logger.info(&format!(
                        "Sketch uses {} bytes ({}%) of program storage space. Maximum is {} bytes.",
                        text,
                        text * 100 / max.max(1),
                        max
                    ));
                    if text > max {
                        return Err(BuildError::SketchTooBig { text, max });
                    }
                }
                None => self.logger.info(&format!("Sketch uses {} bytes of program storage space.", text)),
            }
        }
        if let (Some(data), Some(max)) = (data, max_data) {
            let percent = data * 100 / max.max(1);
            self.logger.info(&format!(
                "Global variables use {} bytes ({}%) of dynamic memory, leaving {} bytes for local variables. Maximum is {} bytes.",
                data,
                percent,
                max.saturating_sub(data),
                max
            ));
            let warn_at = props
                .get("build.warn_data_percentage")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(75);
            if percent > warn_at {
                self.logger
                    .warn("Low memory available, stability problems may occur.");
            }
        }
        Ok(())
    }

    fn print_used_libraries(&self, summary: &BuildSummary) {
        if summary.used_libraries.is_empty() {
            return;
        }
        self.logger.info("");
        for (name, version, root) in &summary.used_libraries {
            if version.is_empty() {
                self.logger
                    .info(&format!("Using library {} in folder: {}", name, root.display()));
            } else {
                self.logger.info(&format!(
                    "Using library {} at version {} in folder: {}",
                    name,
                    version,
                    root.display()
                ));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Free helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Object file name for a source: its path relative to `base`, slashes
/// flattened, with `.o` appended (`src/hw/pwm.c` → `src_hw_pwm.c.o`).
fn object_name(source: &Path, base: &Path) -> String {
    let rel = source.strip_prefix(base).unwrap_or(source);
    let flat = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("_");
    format!("{}.o", flat)
}

fn core_sources(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|ext| matches!(ext, "c" | "cpp" | "S"))
        })
        .map(|e| e.path().to_owned())
        .collect()
}

/// Cross-build signature of the core archive: source paths with their
/// mtimes plus every compile-relevant input.
fn core_signature(sources: &[PathBuf], props: &PropertyMap, includes: &str) -> String {
    let mut acc = String::new();
    for src in sources {
        acc.push_str(&src.to_string_lossy());
        acc.push('\0');
        let mtime = std::fs::metadata(src)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        acc.push_str(&mtime.to_string());
        acc.push('\0');
    }
    for key in ["recipe.c.o.pattern", "recipe.cpp.o.pattern", "recipe.S.o.pattern", "recipe.ar.pattern"] {
        acc.push_str(props.get(key).unwrap_or(""));
        acc.push('\0');
    }
    acc.push_str(includes);
    hash_str(&acc)
}

/// Delete every subdirectory of the libraries build tree that does not
/// belong to a currently imported library.  Plain files are untouched.
fn remove_unused_compiled_libraries(
    libraries_build_dir: &Path,
    imported_names: &HashSet<String>,
) -> Result<()> {
    let entries = match std::fs::read_dir(libraries_build_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !imported_names.contains(&name) {
            std::fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}

/// Ordered hook recipe keys for a phase: the unnumbered pattern first,
/// then numbered children ascending; non-numeric children are ignored.
fn hook_recipe_keys(props: &PropertyMap, phase: &str) -> Vec<String> {
    let base = format!("recipe.hooks.{}", phase);
    let mut keys: Vec<String> = Vec::new();
    let plain = format!("{}.pattern", base);
    if props.contains_key(&plain) {
        keys.push(plain);
    }
    let mut numbered: Vec<u32> = props
        .first_level_of(&base)
        .into_iter()
        .filter_map(|child| child.parse::<u32>().ok())
        .collect();
    numbered.sort_unstable();
    numbered.dedup();
    for n in numbered {
        keys.push(format!("{}.{}.pattern", base, n));
    }
    keys
}

/// Apply a size regex to the tool output, summing the first capture group
/// over every match.
fn sum_size_regex(pattern: &str, output: &str) -> Option<u64> {
    let re = regex::Regex::new(&format!("(?m){}", pattern)).ok()?;
    let mut total: u64 = 0;
    let mut matched = false;
    for caps in re.captures_iter(output) {
        if let Some(group) = caps.get(1) {
            if let Ok(value) = group.as_str().parse::<u64>() {
                total += value;
                matched = true;
            }
        }
    }
    matched.then_some(total)
}

/// Append the bootloader image to the sketch hex so a single file can be
/// flashed onto an erased chip.  The sketch's end-of-file record is dropped,
/// the bootloader brings its own.
fn merge_sketch_with_bootloader(
    props: &PropertyMap,
    build_path: &Path,
    logger: &BuildLogger,
) -> Result<()> {
    let Some(bootloader_file) = props
        .get("bootloader.noblink")
        .or_else(|| props.get("bootloader.file"))
    else {
        return Ok(());
    };
    let bootloader_path = PathBuf::from(props.expand(&format!(
        "{{runtime.platform.path}}/bootloaders/{}",
        bootloader_file
    )));
    if !bootloader_path.is_file() {
        logger.warn(&format!(
            "Bootloader file specified but missing: {}",
            bootloader_path.display()
        ));
        return Ok(());
    }
    let project = props.get("build.project_name").unwrap_or_default();
    let sketch_hex = build_path.join(format!("{}.hex", project));
    if !sketch_hex.is_file() {
        return Ok(());
    }
    let sketch_text = std::fs::read_to_string(&sketch_hex)?;
    let bootloader_text = std::fs::read_to_string(&bootloader_path)?;
    let merged = merge_hex(&sketch_text, &bootloader_text);
    std::fs::write(
        build_path.join(format!("{}.with_bootloader.hex", project)),
        merged,
    )?;
    Ok(())
}

fn merge_hex(sketch: &str, bootloader: &str) -> String {
    let mut out = String::new();
    for line in sketch.lines() {
        if line.trim() == ":00000001FF" {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for line in bootloader.lines() {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
