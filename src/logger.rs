// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: logger  —  build output channel
//
//  All human-facing build output funnels through one BuildLogger so that
//  --quiet and --verbose behave uniformly across phases.  Compiler stderr is
//  passed through unchanged (the diagnostics belong to the toolchain, not to
//  us); only our own status lines get glyphs and color.
// ─────────────────────────────────────────────────────────────────────────────

use colored::Colorize;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildLogger {
    pub verbose: bool,
    pub quiet:   bool,
}

impl BuildLogger {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        BuildLogger { verbose, quiet }
    }

    /// Phase-level status line ("Compiling sketch...").
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Only with --verbose: per-command and per-file detail.
    pub fn detail(&self, msg: &str) {
        if self.verbose && !self.quiet {
            eprintln!("  {}", msg.dimmed());
        }
    }

    /// Warnings always print, even with --quiet.
    pub fn warn(&self, msg: &str) {
        eprintln!("{} {}", "!".yellow().bold(), msg);
    }

    /// Compiler/linker stderr, passed through unchanged.
    pub fn passthrough(&self, text: &str) {
        if !text.is_empty() {
            eprint!("{}", text);
            if !text.ends_with('\n') {
                eprintln!();
            }
        }
    }

    /// Echo a command line about to run (verbose only).
    pub fn command(&self, argv: &[String]) {
        if self.verbose && !self.quiet {
            eprintln!("  {}", argv.join(" ").dimmed());
        }
    }
}
