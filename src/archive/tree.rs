use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::archiver::{Archiver, ResolvedFile};
use super::mapping::{expand_file_mapping, walk_directory, FileMapping};
use super::node::{join_arcpath, NodeInArchive, NodeKind};
use super::symlink::resolve_symlinks;
use crate::template::TemplateContext;

/// Archive-relative path -> node, built up by several producers and
/// written out once by [`ArchiveFileTree::materialize`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveFileTree {
    nodes: BTreeMap<String, NodeInArchive>,
}

impl ArchiveFileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `node`, replacing any node already at its path.
    pub fn add_file(&mut self, node: NodeInArchive) {
        if self.nodes.contains_key(node.arcpath()) {
            debug!(arcpath = node.arcpath(), "overriding existing node");
        }
        self.nodes.insert(node.arcpath().to_string(), node);
    }

    pub fn extend(&mut self, nodes: impl IntoIterator<Item = NodeInArchive>) {
        for node in nodes {
            self.add_file(node);
        }
    }

    pub fn get(&self, arcpath: &str) -> Option<&NodeInArchive> {
        self.nodes.get(arcpath)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInArchive> {
        self.nodes.values()
    }

    /// Newest node timestamp, the ceiling for generated entries.
    pub fn latest_timestamp(&self) -> Option<OffsetDateTime> {
        self.nodes.values().map(NodeInArchive::time).max()
    }

    /// Import every regular file below `source_dir` under `dest_dir`.
    pub fn add_directory_tree(
        &mut self,
        dest_dir: &str,
        source_dir: &Path,
        time: OffsetDateTime,
    ) -> Result<()> {
        let nodes = walk_directory(dest_dir, source_dir, time)?;
        debug!(dest_dir, source = %source_dir.display(), files = nodes.len(), "imported directory");
        self.extend(nodes);
        Ok(())
    }

    /// Apply templated mapping rules. Nothing is inserted unless every rule
    /// succeeds.
    pub fn add_file_mapping(
        &mut self,
        dest_dir: &str,
        mapping: &FileMapping,
        source_root: &Path,
        ctx: &TemplateContext,
        time: OffsetDateTime,
    ) -> Result<()> {
        let nodes = expand_file_mapping(dest_dir, mapping, source_root, ctx, time)?;
        debug!(dest_dir, files = nodes.len(), "applied file mapping");
        self.extend(nodes);
        Ok(())
    }

    /// Nodes sitting below something that is not a directory would make the
    /// archive ambiguous.
    fn check_parents(&self) -> Result<()> {
        for path in self.nodes.keys() {
            let mut end = 0;
            while let Some(pos) = path[end..].find('/') {
                end += pos;
                if let Some(parent) = self.nodes.get(&path[..end]) {
                    if !matches!(parent.kind(), NodeKind::Directory) {
                        bail!(
                            "'{}' lies below '{}', which is not a directory",
                            path,
                            parent.arcpath()
                        );
                    }
                }
                end += 1;
            }
        }
        Ok(())
    }

    /// Write every node into `archiver` under `base`.
    ///
    /// Symlinks are resolved up front, so an unresolvable link fails before
    /// any entry is written. Direct nodes go first, then links in the order
    /// they resolved.
    pub fn materialize(self, archiver: &mut Archiver, base: &str) -> Result<()> {
        self.check_parents()?;

        let mut files: BTreeMap<String, &NodeInArchive> = BTreeMap::new();
        let mut symlinks = Vec::new();
        for (path, node) in &self.nodes {
            match node.kind() {
                NodeKind::Symlink(_) => symlinks.push(node),
                NodeKind::File(_) | NodeKind::Data(_) => {
                    files.insert(path.clone(), node);
                }
                NodeKind::Directory => {}
            }
        }
        let resolution = resolve_symlinks(&files, &symlinks)?;

        for (path, node) in &self.nodes {
            if !node.is_symlink() {
                archiver.add_node(&join_arcpath(base, path), node)?;
            }
        }
        for symlink in &resolution.symlinks {
            let copies: Vec<ResolvedFile<'_>> = symlink
                .files
                .iter()
                .map(|file| ResolvedFile {
                    arcpath: join_arcpath(base, &file.arcpath),
                    node: file.node,
                })
                .collect();
            archiver.add_symlink(
                &join_arcpath(base, symlink.link.arcpath()),
                &symlink.target,
                symlink.link.time(),
                &copies,
            )?;
        }

        info!(
            base,
            nodes = self.nodes.len(),
            symlinks = resolution.symlinks.len(),
            passes = resolution.passes,
            "materialized tree"
        );
        Ok(())
    }
}
