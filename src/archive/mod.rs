//! Archive construction.
//!
//! Producers fill an [`ArchiveFileTree`] with [`NodeInArchive`] values; the
//! tree then streams itself into an [`Archiver`], which writes the same
//! entries into a zip and into gzip/xz tarballs. Zip cannot hold symlinks, so
//! the tree resolves them first (see [`symlink`]) and hands the archiver the
//! file copies to use instead.

pub mod archiver;
pub mod mapping;
pub mod node;
pub mod symlink;
pub mod tree;

pub use archiver::{ArchiveFormat, ArchiveTargets, Archiver, ResolvedFile, GIT_HASH_FILENAME};
pub use mapping::FileMapping;
pub use node::{NodeInArchive, NodeKind, MODE_DIRECTORY, MODE_EXECUTABLE, MODE_FILE, MODE_SYMLINK};
pub use tree::ArchiveFileTree;
