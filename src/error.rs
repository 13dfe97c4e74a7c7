// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: error
// ─────────────────────────────────────────────────────────────────────────────

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    // ── User input ────────────────────────────────────────────────────────────
    #[error("Invalid FQBN '{0}' — expected vendor:architecture:board[:options]")]
    InvalidFqbn(String),

    #[error("Invalid build property '{0}' — expected key=value")]
    InvalidBuildProperty(String),

    #[error("Sketch not found at {}", .0.display())]
    SketchNotFound(PathBuf),

    #[error("Main sketch file '{file}' does not match sketch folder '{folder}'\n  Hint: rename the folder (or the file) so the base names agree")]
    SketchNameMismatch { file: String, folder: String },

    #[error("Build path {} is inside the sketch folder — choose a build path outside it", .0.display())]
    BuildPathInsideSketch(PathBuf),

    #[error("Unknown board '{board}' for platform {vendor}:{arch}\n  Hint: check boards.txt of the installed platform")]
    UnknownBoard { vendor: String, arch: String, board: String },

    #[error("Platform '{vendor}:{arch}' is not installed\n  Searched: {searched}")]
    PlatformNotFound { vendor: String, arch: String, searched: String },

    // ── Library resolution ────────────────────────────────────────────────────
    #[error("{header}: No such file or directory\n{diagnostic}\nLibraries used so far:\n{used}")]
    UnresolvedInclude { header: String, diagnostic: String, used: String },

    #[error("Multiple libraries were found for '{header}':\n{candidates}")]
    AmbiguousInclude { header: String, candidates: String },

    // ── Recipes and toolchain ─────────────────────────────────────────────────
    #[error("Recipe '{0}' is not defined by the selected platform")]
    RecipeNotFound(String),

    #[error("Recipe '{key}' is malformed: {detail}")]
    MalformedRecipe { key: String, detail: String },

    #[error("Compilation failed:\n{output}")]
    CompileFailed { output: String },

    #[error("Link failed:\n{output}")]
    LinkFailed { output: String },

    #[error("Pre-build hook '{recipe}' failed:\n{output}")]
    HookFailed { recipe: String, output: String },

    #[error("Sketch too big: {text} bytes of program storage used, maximum is {max} bytes\n  Hint: remove unused code or libraries")]
    SketchTooBig { text: u64, max: u64 },

    // ── Environment ───────────────────────────────────────────────────────────
    #[error("Cannot run '{tool}': {detail}\n  Hint: verify the platform toolchain is installed")]
    ToolSpawnFailed { tool: String, detail: String },

    #[error("Build cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;
