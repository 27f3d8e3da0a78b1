//! Reproducible release archives for source projects.
//!
//! Builds source snapshots of a git commit and development bundles of
//! pre-built outputs, writing the same logical tree to zip, tar.gz and
//! tar.xz with byte-identical results across runs.
//!
//! # Architecture
//!
//! ```text
//! release-builder (this crate)
//!     │
//!     ├── source     Pulls a commit's tree out of git (bulk export or batch reads)
//!     │               and stamps every file with its last-commit time
//!     ├── archive    In-memory ArchiveFileTree, symlink resolution, file mapping,
//!     │               and the multi-format Archiver
//!     ├── template   @TOKEN@ substitution for names and `.in` files
//!     ├── config     release-info.json / .toml
//!     └── release    Releaser: source archives, devel bundles, SHA256SUMS
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use release_builder::archive::{ArchiveFileTree, ArchiveFormat, ArchiveTargets, Archiver};
//! use release_builder::source::{CannedSource, SourceCollector};
//!
//! let mut tree = ArchiveFileTree::new();
//! SourceCollector::new(CannedSource::dry_run()?, "HEAD").add_to_tree(&mut tree, "")?;
//!
//! let targets = ArchiveTargets::in_dir(dist, "demo-1.0.0", &ArchiveFormat::ALL);
//! let mut archiver = Archiver::open(&targets)?;
//! tree.materialize(&mut archiver, "demo-1.0.0")?;
//! archiver.close()?;
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod process;
pub mod release;
pub mod source;
pub mod template;

pub use archive::{ArchiveFileTree, ArchiveFormat, Archiver, NodeInArchive};
pub use config::ReleaseInfo;
pub use error::BuildError;
pub use release::{ReleaseOptions, Releaser};
pub use source::{CollectStrategy, SourceCollector};
pub use template::TemplateContext;
