//! Per-path "last touched" times from commit history.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

/// Paths changed by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTouch {
    pub time: OffsetDateTime,
    pub paths: Vec<String>,
}

/// Parse an ISO-8601 commit time.
///
/// Some repositories carry commits with an impossible UTC offset (such as
/// `+32:00`); those are read as UTC with a warning.
pub fn parse_commit_time(raw: &str) -> Result<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(time) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(time);
    }
    warn!(time = raw, "invalid commit time");
    let bytes = raw.as_bytes();
    if bytes.len() > 6 && matches!(bytes[bytes.len() - 6], b'+' | b'-') {
        let clamped = format!("{}+00:00", &raw[..raw.len() - 6]);
        if let Ok(time) = OffsetDateTime::parse(&clamped, &Rfc3339) {
            return Ok(time);
        }
    }
    bail!("cannot parse commit time '{}'", raw)
}

/// Parse `git log --name-status --pretty=time=%cI` output, newest first.
pub fn parse_name_status_log(text: &str) -> Result<Vec<CommitTouch>> {
    let mut commits: Vec<CommitTouch> = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(raw) = line.strip_prefix("time=") {
            commits.push(CommitTouch {
                time: parse_commit_time(raw)?,
                paths: Vec::new(),
            });
            continue;
        }
        let current = commits
            .last_mut()
            .with_context(|| format!("log line '{line}' precedes any commit time"))?;
        // "<status>\t<path>[\t<path>]" (renames and copies carry two paths)
        let mut fields = line.split('\t');
        fields.next();
        current.paths.extend(fields.map(String::from));
    }
    Ok(commits)
}

/// Map each of `paths` to the time of the newest commit touching it.
///
/// Paths absent from the history get the newest time seen for any path.
pub fn path_times(
    history: &[CommitTouch],
    paths: &BTreeSet<String>,
) -> Result<BTreeMap<String, OffsetDateTime>> {
    let mut times = BTreeMap::new();
    for commit in history {
        for path in &commit.paths {
            if paths.contains(path) && !times.contains_key(path) {
                times.insert(path.clone(), commit.time);
            }
        }
    }

    let missing: Vec<&String> = paths.iter().filter(|p| !times.contains_key(*p)).collect();
    if !missing.is_empty() {
        let Some(max) = times.values().max().copied() else {
            bail!("commit history has no time for any of {} paths", paths.len());
        };
        warn!(paths = ?missing, "no commit times found, using the newest time");
        for path in missing {
            times.insert(path.clone(), max);
        }
    }
    Ok(times)
}
