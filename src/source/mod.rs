//! Historical source trees.
//!
//! A [`SourceCollector`] turns the tree of one commit into archive nodes
//! whose timestamps come from commit history, never from a checkout. The
//! repository is reached through the [`ContentSource`] trait, implemented by
//! [`git::GitBackend`] for real repositories and [`CannedSource`] for dry
//! runs and tests.
//!
//! Two strategies produce the same nodes:
//! - [`CollectStrategy::BulkExport`] unpacks one tar stream of the tree.
//! - [`CollectStrategy::BatchRead`] lists the tree, then reads object
//!   contents in fixed-size batches over one long-lived reader.

pub mod batch;
pub mod git;
pub mod history;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::archive::{ArchiveFileTree, NodeInArchive, MODE_EXECUTABLE, MODE_FILE};
use crate::error::BuildError;
pub use history::CommitTouch;

pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Kind of a tracked tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    Blob,
    Symlink,
    /// Gitlink to another repository; it has no content here.
    Submodule,
}

/// One line of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub mode: u32,
    pub object: String,
    pub kind: TreeEntryKind,
}

/// Access to the content of one repository.
pub trait ContentSource {
    /// The whole tree at `commit` as an uncompressed tar stream.
    fn export_tree(&mut self, commit: &str) -> Result<Vec<u8>>;

    /// Every tracked path at `commit`.
    fn list_tree(&mut self, commit: &str) -> Result<Vec<TreeEntry>>;

    /// Content of each entry's object, in order.
    fn read_batch(&mut self, entries: &[TreeEntry]) -> Result<Vec<Vec<u8>>>;

    /// Commits reachable from `commit`, newest first, with the paths each touched.
    fn file_history(&mut self, commit: &str) -> Result<Vec<CommitTouch>>;
}

impl<S: ContentSource + ?Sized> ContentSource for Box<S> {
    fn export_tree(&mut self, commit: &str) -> Result<Vec<u8>> {
        (**self).export_tree(commit)
    }

    fn list_tree(&mut self, commit: &str) -> Result<Vec<TreeEntry>> {
        (**self).list_tree(commit)
    }

    fn read_batch(&mut self, entries: &[TreeEntry]) -> Result<Vec<Vec<u8>>> {
        (**self).read_batch(entries)
    }

    fn file_history(&mut self, commit: &str) -> Result<Vec<CommitTouch>> {
        (**self).file_history(commit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CollectStrategy {
    /// Unpack one exported tar stream.
    #[default]
    #[value(name = "bulk")]
    BulkExport,
    /// List the tree and read objects in batches.
    #[value(name = "batch")]
    BatchRead,
}

/// Decides which repository paths are kept.
pub type PathFilter = fn(&str) -> bool;

pub fn keep_all(_path: &str) -> bool {
    true
}

/// Drop version-control metadata, but keep `.gitmodules`.
pub fn project_path_filter(path: &str) -> bool {
    path.contains(".gitmodules") || !path.starts_with(".git")
}

/// [`project_path_filter`] minus test trees, for bundled third-party repos.
pub fn external_repo_path_filter(path: &str) -> bool {
    project_path_filter(path) && !path.starts_with("test/") && !path.starts_with("tests/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Content {
    Data(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Collected {
    mode: u32,
    content: Content,
}

fn file_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

/// Extracts the tree of one commit from a [`ContentSource`].
pub struct SourceCollector<S> {
    source: S,
    commit: String,
    filter: PathFilter,
    strategy: CollectStrategy,
    batch_size: usize,
}

impl<S: ContentSource> SourceCollector<S> {
    pub fn new(source: S, commit: impl Into<String>) -> Self {
        Self {
            source,
            commit: commit.into(),
            filter: keep_all,
            strategy: CollectStrategy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn strategy(mut self, strategy: CollectStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Objects requested per batch; values below one are raised to one.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Every kept file and symlink, with its last-touch time.
    pub fn collect(&mut self) -> Result<Vec<NodeInArchive>> {
        let entries = match self.strategy {
            CollectStrategy::BulkExport => self.collect_bulk()?,
            CollectStrategy::BatchRead => self.collect_batch()?,
        };
        let paths: BTreeSet<String> = entries.keys().cloned().collect();
        let history = self.source.file_history(&self.commit)?;
        let times = history::path_times(&history, &paths)?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (path, entry) in entries {
            let time = times
                .get(&path)
                .copied()
                .with_context(|| format!("no time for '{path}'"))?;
            let node = match entry.content {
                Content::Data(data) => NodeInArchive::from_data(&path, data, entry.mode, time)?,
                Content::Symlink(target) => NodeInArchive::symlink(&path, &target, time)?,
            };
            nodes.push(node);
        }
        info!(commit = %self.commit, strategy = ?self.strategy, files = nodes.len(), "collected source tree");
        Ok(nodes)
    }

    /// Collect and insert every node under `base`. Returns the newest time.
    pub fn add_to_tree(
        &mut self,
        tree: &mut ArchiveFileTree,
        base: &str,
    ) -> Result<Option<OffsetDateTime>> {
        let mut latest = None;
        for node in self.collect()? {
            latest = latest.max(Some(node.time()));
            tree.add_file(node.rebased(base)?);
        }
        Ok(latest)
    }

    fn collect_bulk(&mut self) -> Result<BTreeMap<String, Collected>> {
        let stream = self.source.export_tree(&self.commit)?;
        let mut archive = tar::Archive::new(Cursor::new(stream));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().context("reading exported tree")? {
            let mut entry = entry.context("reading exported tree entry")?;
            let path = entry
                .path()
                .context("reading exported path")?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                tar::EntryType::Directory | tar::EntryType::XGlobalHeader
            ) || !(self.filter)(&path)
            {
                continue;
            }
            let mode = entry.header().mode().context("reading exported mode")?;
            let content = match entry_type {
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut data = Vec::new();
                    entry
                        .read_to_end(&mut data)
                        .with_context(|| format!("reading exported '{path}'"))?;
                    Content::Data(data)
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .context("reading link target")?
                        .with_context(|| format!("symlink '{path}' has no target"))?;
                    Content::Symlink(target.to_string_lossy().into_owned())
                }
                other => {
                    return Err(BuildError::UnsupportedEntry {
                        path,
                        kind: format!("{other:?}"),
                    }
                    .into())
                }
            };
            entries.insert(
                path,
                Collected {
                    mode: file_mode(mode),
                    content,
                },
            );
        }
        Ok(entries)
    }

    fn collect_batch(&mut self) -> Result<BTreeMap<String, Collected>> {
        let listing: Vec<TreeEntry> = self
            .source
            .list_tree(&self.commit)?
            .into_iter()
            .filter(|e| e.kind != TreeEntryKind::Submodule && (self.filter)(&e.path))
            .collect();

        let mut entries = BTreeMap::new();
        for chunk in listing.chunks(self.batch_size) {
            let contents = self.source.read_batch(chunk)?;
            if contents.len() != chunk.len() {
                return Err(BuildError::ProtocolDesync(format!(
                    "requested {} objects, received {}",
                    chunk.len(),
                    contents.len()
                ))
                .into());
            }
            debug!(objects = chunk.len(), "read object batch");
            for (entry, data) in chunk.iter().zip(contents) {
                let content = match entry.kind {
                    TreeEntryKind::Symlink => Content::Symlink(
                        String::from_utf8(data)
                            .with_context(|| format!("symlink '{}' target is not UTF-8", entry.path))?,
                    ),
                    _ => Content::Data(data),
                };
                entries.insert(
                    entry.path.clone(),
                    Collected {
                        mode: file_mode(entry.mode),
                        content,
                    },
                );
            }
        }
        Ok(entries)
    }
}

/// A fixed in-memory repository.
///
/// Object ids are content hashes, so listing and batch reads agree with the
/// exported stream.
#[derive(Debug, Clone, Default)]
pub struct CannedSource {
    files: BTreeMap<String, (u32, Content)>,
    history: Vec<CommitTouch>,
}

impl CannedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files
            .insert(path.to_string(), (MODE_FILE, Content::Data(data.into())));
        self
    }

    pub fn executable(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files
            .insert(path.to_string(), (MODE_EXECUTABLE, Content::Data(data.into())));
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.files.insert(
            path.to_string(),
            (0o120000, Content::Symlink(target.to_string())),
        );
        self
    }

    /// Record a commit at `time` touching `paths`. Add newest first.
    pub fn commit(mut self, time: OffsetDateTime, paths: &[&str]) -> Self {
        self.history.push(CommitTouch {
            time,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    /// Stand-in repository used by dry runs.
    pub fn dry_run() -> Result<Self> {
        let history = history::parse_name_status_log(
            "time=2024-03-14T15:40:25-07:00\n\nM\tCMakeLists.txt\n",
        )?;
        let mut source = Self::new()
            .file("CMakeLists.txt", "cmake_minimum_required(VERSION 3.16)\n")
            .file("README.md", "dry run\n")
            .file("LICENSE.txt", "dry run license\n")
            .file("include/project.h", "#pragma once\n")
            .file(".gitmodules", "")
            .file(".github/workflows/ci.yml", "on: push\n");
        source.history = history;
        Ok(source)
    }

    fn object_id(content: &Content) -> String {
        let bytes = match content {
            Content::Data(data) => data.as_slice(),
            Content::Symlink(target) => target.as_bytes(),
        };
        format!("{:x}", Sha256::digest(bytes))
    }
}

impl ContentSource for CannedSource {
    fn export_tree(&mut self, _commit: &str) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, (mode, content)) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(mode & 0o7777);
            match content {
                Content::Data(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, path, data.as_slice())?;
                }
                Content::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target)?;
                }
            }
        }
        Ok(builder.into_inner()?)
    }

    fn list_tree(&mut self, _commit: &str) -> Result<Vec<TreeEntry>> {
        Ok(self
            .files
            .iter()
            .map(|(path, (mode, content))| TreeEntry {
                path: path.clone(),
                mode: *mode,
                object: Self::object_id(content),
                kind: match content {
                    Content::Data(_) => TreeEntryKind::Blob,
                    Content::Symlink(_) => TreeEntryKind::Symlink,
                },
            })
            .collect())
    }

    fn read_batch(&mut self, entries: &[TreeEntry]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let content = self
                .files
                .values()
                .map(|(_, content)| content)
                .find(|content| Self::object_id(content) == entry.object)
                .ok_or_else(|| BuildError::MissingObject {
                    object: entry.object.clone(),
                    path: entry.path.clone(),
                })?;
            out.push(match content {
                Content::Data(data) => data.clone(),
                Content::Symlink(target) => target.clone().into_bytes(),
            });
        }
        Ok(out)
    }

    fn file_history(&mut self, _commit: &str) -> Result<Vec<CommitTouch>> {
        if self.history.is_empty() {
            bail!("canned repository has no commits");
        }
        Ok(self.history.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::NodeKind;
    use time::macros::datetime;

    fn sample() -> CannedSource {
        CannedSource::new()
            .file("README.txt", "readme\n")
            .executable("build.sh", "#!/bin/sh\n")
            .file("shared/lib/a.so", "a")
            .symlink("lib", "shared/lib")
            .file(".gitignore", "target\n")
            .file(".gitmodules", "")
            .file("tests/t.c", "int main;\n")
            .commit(datetime!(2024-03-14 15:40:25 -7), &["README.txt", "lib"])
            .commit(
                datetime!(2023-01-01 0:00 UTC),
                &["README.txt", "build.sh", "shared/lib/a.so", ".gitignore", "tests/t.c"],
            )
    }

    fn collect(strategy: CollectStrategy, filter: PathFilter) -> Vec<NodeInArchive> {
        SourceCollector::new(sample(), "abc123")
            .strategy(strategy)
            .filter(filter)
            .batch_size(2)
            .collect()
            .unwrap()
    }

    #[test]
    fn test_strategies_agree() {
        for filter in [keep_all as PathFilter, project_path_filter, external_repo_path_filter] {
            assert_eq!(
                collect(CollectStrategy::BulkExport, filter),
                collect(CollectStrategy::BatchRead, filter)
            );
        }
    }

    #[test]
    fn test_collected_nodes() {
        let nodes = collect(CollectStrategy::BatchRead, external_repo_path_filter);
        let paths: Vec<&str> = nodes.iter().map(NodeInArchive::arcpath).collect();
        assert_eq!(paths, vec![".gitmodules", "README.txt", "build.sh", "lib", "shared/lib/a.so"]);

        let by_path = |p: &str| nodes.iter().find(|n| n.arcpath() == p).unwrap();
        assert_eq!(by_path("README.txt").time(), datetime!(2024-03-14 15:40:25 -7));
        assert_eq!(by_path("build.sh").mode(), MODE_EXECUTABLE);
        assert_eq!(by_path("build.sh").time(), datetime!(2023-01-01 0:00 UTC));
        assert_eq!(by_path("lib").kind(), &NodeKind::Symlink("shared/lib".into()));
        // Untouched by history: falls back to the newest time.
        assert_eq!(by_path(".gitmodules").time(), datetime!(2024-03-14 15:40:25 -7));
    }

    #[test]
    fn test_path_filters() {
        assert!(project_path_filter(".gitmodules"));
        assert!(!project_path_filter(".github/workflows/x.yml"));
        assert!(project_path_filter("src/.gitignore"));
        assert!(project_path_filter("test/x.c"));
        assert!(!external_repo_path_filter("test/x.c"));
        assert!(!external_repo_path_filter("tests/x.c"));
        assert!(external_repo_path_filter("src/tests/x.c"));
    }

    #[test]
    fn test_add_to_tree_rebases() {
        let mut tree = ArchiveFileTree::new();
        let latest = SourceCollector::new(sample(), "abc123")
            .filter(project_path_filter)
            .add_to_tree(&mut tree, "proj-1.0")
            .unwrap();
        assert_eq!(latest, Some(datetime!(2024-03-14 15:40:25 -7)));
        assert!(tree.get("proj-1.0/README.txt").is_some());
        assert!(tree.get("proj-1.0/.gitignore").is_none());
    }

    #[test]
    fn test_dry_run_source_collects() {
        let nodes = SourceCollector::new(CannedSource::dry_run().unwrap(), "e5812a9")
            .filter(project_path_filter)
            .collect()
            .unwrap();
        assert!(nodes.iter().any(|n| n.arcpath() == "CMakeLists.txt"));
        assert!(nodes.iter().all(|n| !n.arcpath().starts_with(".github")));
    }
}
