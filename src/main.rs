// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build  —  recipe-driven sketch build pipeline
// ─────────────────────────────────────────────────────────────────────────────

mod builder;
mod cache;
mod cancel;
mod compiledb;
mod error;
mod library;
mod logger;
mod options;
mod platform;
mod preprocess;
mod props;
mod prototypes;
mod recipe;
mod resolver;
mod sketch;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use builder::{BuildInputs, Builder};
use cancel::CancelToken;
use error::{BuildError, Result};
use logger::BuildLogger;

// ─────────────────────────────────────────────────────────────────────────────
//  CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "hotaru-build",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Sketch build pipeline for Arduino-style boards — recipes in, firmware out",
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    #[arg(long, global = true)]
    quiet: bool,

    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile a sketch for a fully qualified board name
    Compile(CompileArgs),
    /// List the boards a platform declares
    Boards(BoardsArgs),
}

// ── Compile args ──────────────────────────────────────────────────────────────

#[derive(Args)]
struct CompileArgs {
    /// Target board, e.g. arduino:avr:uno or arduino:avr:nano:cpu=atmega328old
    #[arg(long, short = 'b')]
    fqbn: String,

    #[arg(long)]
    sketch: PathBuf,

    #[arg(long)]
    build_path: PathBuf,

    /// Extra build property, key=value (repeatable, wins over the board)
    #[arg(long = "build-property", value_name = "KEY=VALUE")]
    build_properties: Vec<String>,

    /// Parallel compile jobs (0 = number of CPUs)
    #[arg(long, short = 'j', default_value_t = 0)]
    jobs: usize,

    /// Wipe the build directory before building
    #[arg(long)]
    clean: bool,

    /// Use the platform's debug optimization profile
    #[arg(long)]
    optimize_for_debug: bool,

    /// Record compile commands without running the toolchain
    #[arg(long)]
    only_compilation_database: bool,

    /// Hardware search root (repeatable; defaults to the usual locations)
    #[arg(long = "hardware-dir")]
    hardware_dirs: Vec<PathBuf>,

    /// Tools search root (repeatable; defaults to the hardware roots)
    #[arg(long = "tools-dir")]
    tools_dirs: Vec<PathBuf>,

    /// Bundled libraries folder (repeatable)
    #[arg(long = "built-in-libraries-dir")]
    builtin_libraries_dirs: Vec<PathBuf>,

    /// The sketchbook libraries folder (defaults to ~/Arduino/libraries)
    #[arg(long = "libraries-dir")]
    user_libraries_dir: Option<PathBuf>,

    /// Additional unmanaged library folder (repeatable)
    #[arg(long = "library")]
    libraries: Vec<PathBuf>,
}

// ── Boards args ───────────────────────────────────────────────────────────────

#[derive(Args)]
struct BoardsArgs {
    /// Platform to list, as vendor:arch
    #[arg(long, short = 'p')]
    platform: String,

    #[arg(long = "hardware-dir")]
    hardware_dirs: Vec<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = match cli.command {
        Cmd::Compile(a) => cmd_compile(a, cli.verbose, cli.quiet),
        Cmd::Boards(a)  => cmd_boards(a),
    };

    if let Err(e) = result {
        render_error(&e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_compile(args: CompileArgs, verbose: bool, quiet: bool) -> Result<()> {
    let hardware_dirs = if args.hardware_dirs.is_empty() {
        platform::default_hardware_dirs()
    } else {
        args.hardware_dirs
    };
    let tools_dirs = if args.tools_dirs.is_empty() {
        hardware_dirs.clone()
    } else {
        args.tools_dirs
    };
    let user_libraries_dir = args.user_libraries_dir.or_else(|| {
        platform::home_dir()
            .map(|home| home.join("Arduino").join("libraries"))
            .filter(|p| p.is_dir())
    });

    let logger = BuildLogger::new(verbose, quiet);
    let cancel = CancelToken::new();
    cancel::install_interrupt_watcher(cancel.clone());

    if !quiet {
        println!(
            "{} {} {}",
            "Compiling".cyan().bold(),
            format!("[{}]", args.fqbn).dimmed(),
            args.sketch.display().to_string().dimmed(),
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    let inputs = BuildInputs {
        sketch_path:               args.sketch,
        fqbn:                      args.fqbn,
        build_path:                args.build_path,
        hardware_dirs,
        tools_dirs,
        builtin_libraries_dirs:    args.builtin_libraries_dirs,
        user_libraries_dir,
        unmanaged_libraries_dirs:  args.libraries,
        build_properties:          args.build_properties,
        optimize_for_debug:        args.optimize_for_debug,
        jobs:                      args.jobs,
        clean:                     args.clean,
        only_compilation_database: args.only_compilation_database,
    };

    let t0 = Instant::now();
    let summary = Builder::new(inputs, logger, cancel).run()?;

    if !quiet {
        println!(
            "{} compiled in {:.2}s",
            "✓".green().bold(),
            t0.elapsed().as_secs_f64()
        );
        if let Some(elf) = &summary.elf {
            println!("  {} {}", "elf:".dimmed(), elf.display());
        }
    }
    Ok(())
}

fn cmd_boards(args: BoardsArgs) -> Result<()> {
    let (vendor, arch) = args
        .platform
        .split_once(':')
        .ok_or_else(|| BuildError::InvalidFqbn(args.platform.clone()))?;
    let hardware_dirs = if args.hardware_dirs.is_empty() {
        platform::default_hardware_dirs()
    } else {
        args.hardware_dirs
    };
    let platform = platform::find_platform(&hardware_dirs, vendor, arch)?;

    println!("{:<24} {}", "BOARD", "NAME");
    println!("{}", "─".repeat(60).dimmed());
    for (id, name) in platform.board_names() {
        println!(
            "{:<24} {}",
            format!("{}:{}:{}", vendor, arch, id).bold(),
            name
        );
    }
    println!(
        "\n  platform {}:{}@{} at {}",
        vendor,
        arch,
        platform.version,
        platform.root.display().to_string().dimmed()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Error rendering
// ─────────────────────────────────────────────────────────────────────────────

fn render_error(e: &BuildError) {
    match e {
        BuildError::CompileFailed { output } | BuildError::LinkFailed { output } => {
            eprintln!("\n{} {}", "✗".red().bold(), "compilation failed".bold());
            eprintln!("{}", "─".repeat(60).dimmed());
            for line in output.lines() {
                if line.contains("error:") {
                    eprintln!("  {}", line.red());
                } else if line.contains("warning:") {
                    eprintln!("  {}", line.yellow());
                } else if !line.trim().is_empty() {
                    eprintln!("  {}", line.dimmed());
                }
            }
            eprintln!("{}", "─".repeat(60).dimmed());
        }
        BuildError::UnresolvedInclude { .. } | BuildError::AmbiguousInclude { .. } => {
            eprintln!("\n{} {}", "✗".red().bold(), e);
        }
        _ => eprintln!("{} {}", "✗".red().bold(), e),
    }
}
