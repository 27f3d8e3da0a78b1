//! Typed failures raised by the archive engine.
//!
//! Everything in this crate returns `anyhow::Result`; the variants here are
//! the ones a caller may want to tell apart (via `downcast_ref`) instead of
//! just printing. Each one is fatal except where a module documents a local
//! recovery.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// A `@TOKEN@` placeholder has no value in the substitution context.
    #[error("unknown substitution token '@{token}@' in '{template}'")]
    UnknownToken { token: String, template: String },

    /// A source glob in a file-mapping rule matched nothing.
    #[error("glob '{glob}' does not match any file under '{}'", root.display())]
    UnmatchedGlob { glob: String, root: PathBuf },

    /// A file-mapping rule is syntactically wrong.
    #[error("invalid file mapping '{rule}': {reason}")]
    InvalidMapping { rule: String, reason: String },

    /// Symlink resolution stopped making progress.
    #[error("no targets found for symlinks: {}", .0.join(", "))]
    UnresolvedSymlinks(Vec<String>),

    /// A symlink points outside the tree being archived.
    #[error("symlink '{link}' -> '{target}' escapes the archive root")]
    SymlinkEscapesRoot { link: String, target: String },

    /// The batch object reader answered out of order or truncated a frame.
    #[error("batch object protocol out of sync: {0}")]
    ProtocolDesync(String),

    /// An object listed in the tree is absent from the batch response.
    #[error("object {object} for '{path}' is missing from the repository")]
    MissingObject { object: String, path: String },

    /// A backend command ran but exited unsuccessfully.
    #[error("command '{command}' failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// A backend command is not installed.
    #[error("required tool '{0}' was not found in PATH")]
    ToolNotFound(String),

    /// A path the release description requires never made it into the archive.
    #[error("'{0}' must exist in the archive")]
    MissingRequiredFile(String),

    /// A directory walk or tree export met something that is not a plain file.
    #[error("'{path}': unsupported entry type ({kind})")]
    UnsupportedEntry { path: String, kind: String },
}
