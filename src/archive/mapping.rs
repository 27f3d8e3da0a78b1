//! Declarative file-mapping rules.
//!
//! A mapping sends destination directory templates to lists of source
//! rules. A rule is either a glob (relative to the source root) or
//! `src:newname`, a single file renamed on the way in; a `src` ending in
//! `.in` is read as text and configured before insertion.
//!
//! Planning substitutes every template and expands every glob before a
//! single node is produced, so a bad rule never leaves a half-filled tree.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use walkdir::WalkDir;

use super::node::{join_arcpath, normalize_arcpath, NodeInArchive, MODE_FILE};
use crate::error::BuildError;
use crate::template::TemplateContext;

/// Destination directory template -> source rule templates.
pub type FileMapping = BTreeMap<String, Vec<String>>;

/// Suffix marking a source as a text template.
pub const TEMPLATE_SUFFIX: &str = ".in";

#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleSource {
    Rename { src: String, name: String },
    Glob(String),
}

/// A rule with every token substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedRule {
    dest_dir: String,
    source: RuleSource,
}

fn parse_rule(dest_dir: &str, rule: &str, ctx: &TemplateContext) -> Result<PlannedRule> {
    let invalid = |reason: &str| BuildError::InvalidMapping {
        rule: rule.to_string(),
        reason: reason.to_string(),
    };
    let dest_dir = ctx.configure_path(dest_dir)?;
    let source = match rule.split_once(':') {
        Some((src, name)) => {
            let src = ctx.configure_path(src)?;
            let name = ctx.configure_path(name)?;
            if src.is_empty() || name.is_empty() {
                return Err(invalid("both sides of ':' must be non-empty").into());
            }
            if name.contains('/') {
                return Err(invalid("the new name must not contain '/'").into());
            }
            RuleSource::Rename { src, name }
        }
        None => {
            let pattern = ctx.configure_path(rule)?;
            if pattern.is_empty() {
                return Err(invalid("empty glob").into());
            }
            glob::Pattern::new(&pattern).map_err(|e| invalid(&e.to_string()))?;
            RuleSource::Glob(pattern)
        }
    };
    Ok(PlannedRule { dest_dir, source })
}

/// Produce the nodes `mapping` places under `dest_dir`, or fail without
/// producing any.
pub fn expand_file_mapping(
    dest_dir: &str,
    mapping: &FileMapping,
    root: &Path,
    ctx: &TemplateContext,
    time: OffsetDateTime,
) -> Result<Vec<NodeInArchive>> {
    let mut planned = Vec::new();
    for (rule_dest, rules) in mapping {
        for rule in rules {
            planned.push(parse_rule(rule_dest, rule, ctx)?);
        }
    }

    let mut nodes = Vec::new();
    for rule in planned {
        let dest = join_arcpath(dest_dir, &rule.dest_dir);
        match rule.source {
            RuleSource::Rename { src, name } => {
                let path = root.join(&src);
                let arcpath = join_arcpath(&dest, &name);
                if src.ends_with(TEMPLATE_SUFFIX) {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading template '{}'", path.display()))?;
                    let configured = ctx
                        .configure(&text)
                        .with_context(|| format!("configuring '{}'", path.display()))?;
                    nodes.push(NodeInArchive::from_data(&arcpath, configured, MODE_FILE, time)?);
                } else {
                    nodes.push(NodeInArchive::from_fs(&arcpath, &path, time)?);
                }
            }
            RuleSource::Glob(pattern) => {
                for path in glob_matches(root, &pattern)? {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .with_context(|| format!("'{}' has no file name", path.display()))?;
                    let arcpath = join_arcpath(&dest, &name);
                    if path.is_dir() {
                        nodes.extend(walk_directory(&arcpath, &path, time)?);
                    } else {
                        nodes.push(NodeInArchive::from_fs(&arcpath, &path, time)?);
                    }
                }
            }
        }
    }
    Ok(nodes)
}

fn glob_matches(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let root_str = root.to_string_lossy();
    let full = format!("{}/{}", glob::Pattern::escape(root_str.trim_end_matches('/')), pattern);
    let mut matches = Vec::new();
    for entry in glob::glob(&full).with_context(|| format!("invalid glob '{pattern}'"))? {
        matches.push(entry.with_context(|| format!("expanding glob '{pattern}'"))?);
    }
    if matches.is_empty() {
        return Err(BuildError::UnmatchedGlob {
            glob: pattern.to_string(),
            root: root.to_path_buf(),
        }
        .into());
    }
    matches.sort();
    Ok(matches)
}

/// One file node per regular file below `dir`, placed under `dest`.
///
/// Symlinks and special files are rejected.
pub fn walk_directory(dest: &str, dir: &Path, time: OffsetDateTime) -> Result<Vec<NodeInArchive>> {
    let mut nodes = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("'{}' is outside '{}'", entry.path().display(), dir.display()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let arcpath = normalize_arcpath(&join_arcpath(dest, &rel))?;
        nodes.push(NodeInArchive::from_fs(&arcpath, entry.path(), time)?);
    }
    Ok(nodes)
}
