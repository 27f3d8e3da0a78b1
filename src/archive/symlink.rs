//! Symlink expansion for formats without a symlink entry type.
//!
//! Resolution runs in passes over a worklist. Each pass looks every pending
//! link up in the set of archive paths that already hold content; paths
//! produced by links resolved in a pass only become visible to the next one,
//! so a chain of length `n` needs at most `n` passes.
//!
//! A directory alias normally waits until no pending link lies inside its
//! target. When a pass stalls, it is rerun once with that wait lifted, which
//! untangles links that point back through the alias. A stall in that rerun
//! is fatal.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use super::archiver::ResolvedFile;
use super::node::{join_arcpath, NodeInArchive, NodeKind};
use crate::error::BuildError;

/// The copies a symlink expands to in a symlink-incapable format.
#[derive(Debug)]
pub struct ResolvedSymlink<'a> {
    pub link: &'a NodeInArchive,
    pub target: String,
    pub files: Vec<ResolvedFile<'a>>,
}

/// Result of running every pass.
#[derive(Debug)]
pub struct Resolution<'a> {
    /// Links in the order they resolved.
    pub symlinks: Vec<ResolvedSymlink<'a>>,
    pub passes: usize,
}

/// Collapse `<dir of link>/<target>` into a root-relative archive path.
///
/// Absolute targets, and targets climbing above the root, are rejected.
pub fn normalize_symlink_target(link: &str, target: &str) -> Result<String> {
    let escapes = || BuildError::SymlinkEscapesRoot {
        link: link.to_string(),
        target: target.to_string(),
    };
    if target.starts_with('/') {
        return Err(escapes().into());
    }

    let mut stack: Vec<&str> = link.split('/').collect();
    stack.pop();
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(escapes().into());
                }
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        // A link to the archive root would alias the whole tree, itself included.
        return Err(escapes().into());
    }
    Ok(stack.join("/"))
}

/// Resolve `symlinks` against `files`, the archive paths that already hold
/// content (each mapped to the node providing it).
pub fn resolve_symlinks<'a>(
    files: &BTreeMap<String, &'a NodeInArchive>,
    symlinks: &[&'a NodeInArchive],
) -> Result<Resolution<'a>> {
    let mut added = files.clone();
    let mut pending = Vec::with_capacity(symlinks.len());
    for &link in symlinks {
        let NodeKind::Symlink(target) = link.kind() else {
            continue;
        };
        let normalized = normalize_symlink_target(link.arcpath(), target)?;
        pending.push((link, target.clone(), normalized));
    }

    let mut resolved = Vec::new();
    let mut passes = 0;
    let mut relaxed = false;
    while !pending.is_empty() {
        passes += 1;
        let unresolved: BTreeSet<&'a str> = if relaxed {
            BTreeSet::new()
        } else {
            pending.iter().map(|&(l, _, _)| l.arcpath()).collect()
        };
        let mut discovered: BTreeMap<String, &'a NodeInArchive> = BTreeMap::new();
        let mut waiting = Vec::new();

        for (link, target, normalized) in pending {
            let copies = match added.get(&normalized) {
                Some(&node) => vec![ResolvedFile {
                    arcpath: link.arcpath().to_string(),
                    node,
                }],
                None => alias_copies(&added, &unresolved, link, &normalized),
            };
            if copies.is_empty() {
                waiting.push((link, target, normalized));
                continue;
            }
            for copy in &copies {
                discovered.insert(copy.arcpath.clone(), copy.node);
            }
            resolved.push(ResolvedSymlink {
                link,
                target,
                files: copies,
            });
        }

        if discovered.is_empty() {
            if !relaxed {
                relaxed = true;
                pending = waiting;
                continue;
            }
            return Err(BuildError::UnresolvedSymlinks(
                waiting
                    .iter()
                    .map(|(l, t, _)| format!("{} -> {}", l.arcpath(), t))
                    .collect(),
            )
            .into());
        }
        added.extend(discovered);
        pending = waiting;
        relaxed = false;
    }

    Ok(Resolution {
        symlinks: resolved,
        passes,
    })
}

/// Copies of everything below `dir`, re-rooted under the link.
///
/// Empty while any link in `unresolved` lives below `dir`; aliasing before
/// then would miss its files.
fn alias_copies<'a>(
    added: &BTreeMap<String, &'a NodeInArchive>,
    unresolved: &BTreeSet<&str>,
    link: &NodeInArchive,
    dir: &str,
) -> Vec<ResolvedFile<'a>> {
    let prefix = format!("{dir}/");
    if unresolved.iter().any(|path| path.starts_with(&prefix)) {
        return Vec::new();
    }
    added
        .range(prefix.clone()..)
        .take_while(|(path, _)| path.starts_with(&prefix))
        .map(|(path, &node)| ResolvedFile {
            arcpath: join_arcpath(link.arcpath(), &path[prefix.len()..]),
            node,
        })
        .collect()
}
