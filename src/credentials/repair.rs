//! Structural repair of the credential cache
//!
//! A malformed line is corrected only when a single reading of it yields a valid username and
//! a valid secret hash. Everything else is quarantined: dropped from the live cache and kept in
//! the quarantine file next to the sync backup. Lines that are already well-formed, comments
//! and blank lines are never rewritten.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    credentials::cache::{CacheDocument, CacheEntry, CacheLine},
    identity::RoleName,
    secrets::SecretHash,
};

/// Correction applied to a malformed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fix {
    /// Leading or trailing whitespace removed.
    SurroundingWhitespace,

    /// Separator between the fields normalized to one space.
    FieldSeparator,

    /// Whitespace removed from inside the secret hash.
    HashWhitespace,

    /// Missing quotes added.
    MissingQuotes,
}

/// Why a line was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuarantineReason {
    /// Line has no recognizable structure.
    Unparseable,

    /// Username is not a valid role name (e.g. contains whitespace).
    InvalidUsername,

    /// Secret hash is truncated, unversioned or otherwise invalid.
    InvalidHash,

    /// Several lines name the same user with different hashes.
    ConflictingDuplicate,
}

/// What happened to one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum FindingAction {
    /// Line corrected in place.
    Repaired {
        /// Corrections applied.
        fixes: Vec<Fix>,
    },

    /// Line removed and quarantined.
    Quarantined {
        /// Why.
        reason: QuarantineReason,
    },

    /// Exact duplicate of an earlier entry, removed.
    DuplicateDropped,
}

/// Report for one corrupt line. Never carries the secret hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// 1-based line number.
    pub line: usize,

    /// Username, when one could be read.
    pub username: Option<String>,

    /// Action taken.
    #[serde(flatten)]
    pub action: FindingAction,
}

/// Result of inspecting a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Repaired document.
    pub document: CacheDocument,

    /// One finding per corrupt line, ordered by line.
    pub findings: Vec<Finding>,

    /// Raw text of quarantined lines.
    pub quarantined_lines: Vec<String>,
}

impl Inspection {
    /// Whether no line needed attention.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of lines corrected in place.
    #[must_use]
    pub fn repaired_count(&self) -> usize {
        self.count(|action| matches!(action, FindingAction::Repaired { .. }))
    }

    /// Number of lines quarantined.
    #[must_use]
    pub fn quarantined_count(&self) -> usize {
        self.count(|action| matches!(action, FindingAction::Quarantined { .. }))
    }

    /// Number of exact duplicates dropped.
    #[must_use]
    pub fn duplicates_dropped(&self) -> usize {
        self.count(|action| matches!(action, FindingAction::DuplicateDropped))
    }

    fn count(&self, predicate: impl Fn(&FindingAction) -> bool) -> usize {
        self.findings
            .iter()
            .filter(|finding| predicate(&finding.action))
            .count()
    }
}

enum Classified {
    Keep(String),
    Entry {
        entry: CacheEntry,
        fixes: Vec<Fix>,
    },
    Quarantine {
        reason: QuarantineReason,
        username: Option<String>,
    },
}

/// Check every line against the grammar and compute the repaired document.
#[must_use]
pub fn inspect(contents: &str) -> Inspection {
    let raw_lines: Vec<&str> = contents.lines().collect();

    let mut classified: Vec<Classified> = raw_lines
        .iter()
        .map(|raw| match CacheLine::parse(raw) {
            CacheLine::Entry(entry) => Classified::Entry {
                entry,
                fixes: Vec::new(),
            },
            CacheLine::Other(raw) => Classified::Keep(raw),
            CacheLine::Unparsed(raw) => match repair_line(&raw) {
                Ok((entry, fixes)) => Classified::Entry { entry, fixes },
                Err((reason, username)) => Classified::Quarantine { reason, username },
            },
        })
        .collect();

    let mut duplicates: Vec<usize> = Vec::new();
    let mut by_username: FxHashMap<RoleName, Vec<usize>> = FxHashMap::default();

    for (index, line) in classified.iter().enumerate() {
        if let Classified::Entry { entry, .. } = line {
            by_username
                .entry(entry.username.clone())
                .or_default()
                .push(index);
        }
    }

    for indices in by_username.into_values().filter(|indices| indices.len() > 1) {
        let hashes: Vec<&SecretHash> = indices
            .iter()
            .filter_map(|&index| match classified.get(index) {
                Some(Classified::Entry { entry, .. }) => Some(&entry.secret_hash),
                _ => None,
            })
            .collect();

        let identical = hashes.windows(2).all(|pair| pair.first() == pair.last());

        if identical {
            duplicates.extend(indices.iter().skip(1));
        } else {
            for index in indices {
                let Some(line) = classified.get_mut(index) else {
                    continue;
                };

                let username = match line {
                    Classified::Entry { entry, .. } => entry.username.to_string(),
                    Classified::Keep(_) | Classified::Quarantine { .. } => continue,
                };

                *line = Classified::Quarantine {
                    reason: QuarantineReason::ConflictingDuplicate,
                    username: Some(username),
                };
            }
        }
    }

    let mut inspection = Inspection::default();
    let mut lines = Vec::with_capacity(classified.len());

    for (index, (line, raw)) in classified.into_iter().zip(raw_lines).enumerate() {
        let number = index + 1;

        match line {
            Classified::Keep(raw) => lines.push(CacheLine::Other(raw)),
            Classified::Entry { entry, .. } if duplicates.contains(&index) => {
                inspection.findings.push(Finding {
                    line: number,
                    username: Some(entry.username.to_string()),
                    action: FindingAction::DuplicateDropped,
                });
            }
            Classified::Entry { entry, fixes } => {
                if !fixes.is_empty() {
                    inspection.findings.push(Finding {
                        line: number,
                        username: Some(entry.username.to_string()),
                        action: FindingAction::Repaired { fixes },
                    });
                }

                lines.push(CacheLine::Entry(entry));
            }
            Classified::Quarantine { reason, username } => {
                inspection.findings.push(Finding {
                    line: number,
                    username,
                    action: FindingAction::Quarantined { reason },
                });
                inspection.quarantined_lines.push(raw.to_string());
            }
        }
    }

    inspection.document = CacheDocument::from_lines(lines);

    inspection
}

type RepairFailure = (QuarantineReason, Option<String>);

/// Username a malformed line would authenticate, when one can be read from it.
pub(crate) fn claimed_username(raw: &str) -> Option<String> {
    match repair_line(raw) {
        Ok((entry, _fixes)) => Some(entry.username.to_string()),
        Err((_reason, username)) => username,
    }
}

fn repair_line(raw: &str) -> Result<(CacheEntry, Vec<Fix>), RepairFailure> {
    let mut fixes = Vec::new();
    let mut fix = |applied: Fix| {
        if !fixes.contains(&applied) {
            fixes.push(applied);
        }
    };

    let trimmed = raw.trim();

    if trimmed.len() != raw.len() {
        fix(Fix::SurroundingWhitespace);
    }

    let (username, rest) = if let Some(after) = trimmed.strip_prefix('"') {
        after
            .split_once('"')
            .ok_or((QuarantineReason::Unparseable, None))?
    } else {
        fix(Fix::MissingQuotes);

        trimmed
            .split_once(char::is_whitespace)
            .ok_or((QuarantineReason::Unparseable, None))?
    };

    if username.is_empty() || username.chars().any(char::is_whitespace) {
        return Err((QuarantineReason::InvalidUsername, None));
    }

    let username =
        RoleName::parse(username).map_err(|_name| (QuarantineReason::InvalidUsername, None))?;

    let hash_field = rest.trim_start();

    if rest.strip_prefix(' ') != Some(hash_field) {
        fix(Fix::FieldSeparator);
    }

    let hash_body = match hash_field.strip_prefix('"') {
        Some(inner) => inner.strip_suffix('"').unwrap_or_else(|| {
            fix(Fix::MissingQuotes);
            inner
        }),
        None => {
            fix(Fix::MissingQuotes);
            hash_field.strip_suffix('"').unwrap_or(hash_field)
        }
    };

    if hash_body.contains('"') {
        return Err((QuarantineReason::Unparseable, Some(username.to_string())));
    }

    let compact: String = hash_body.chars().filter(|c| !c.is_whitespace()).collect();

    if compact.len() != hash_body.len() {
        fix(Fix::HashWhitespace);
    }

    let secret_hash = SecretHash::parse(&compact)
        .map_err(|_hash| (QuarantineReason::InvalidHash, Some(username.to_string())))?;

    Ok((
        CacheEntry {
            username,
            secret_hash,
        },
        fixes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::tests::{MD5_HASH, scram_hash};

    fn line(username: &str, hash: &str) -> String {
        format!("\"{username}\" \"{hash}\"")
    }

    #[test]
    fn clean_cache_has_no_findings() {
        let contents = format!(
            "{}\n;; comment\n{}\n",
            line("alice", MD5_HASH),
            line("bob", &scram_hash())
        );

        let inspection = inspect(&contents);

        assert!(inspection.is_clean());
        assert_eq!(inspection.document.render(), contents);
    }

    #[test]
    fn doubled_whitespace_inside_hash_is_repaired_without_touching_other_lines() {
        let scram = scram_hash();
        let broken = scram.replacen('$', "$  ", 2);
        let contents = format!(
            "{}\n\"bob\" \"{broken}\"\n{}\n",
            line("alice", MD5_HASH),
            line("carol", MD5_HASH)
        );

        let inspection = inspect(&contents);

        assert_eq!(inspection.repaired_count(), 1);
        assert_eq!(
            inspection.findings.first().map(|finding| &finding.action),
            Some(&FindingAction::Repaired {
                fixes: vec![Fix::HashWhitespace]
            })
        );
        assert_eq!(
            inspection.document.render(),
            format!(
                "{}\n{}\n{}\n",
                line("alice", MD5_HASH),
                line("bob", &scram),
                line("carol", MD5_HASH)
            )
        );
    }

    #[test]
    fn missing_quotes_and_extra_spacing_are_repaired() {
        let inspection = inspect(&format!("  alice   {MD5_HASH}\t\n"));

        assert_eq!(inspection.repaired_count(), 1);
        assert_eq!(inspection.document.render(), format!("{}\n", line("alice", MD5_HASH)));
    }

    #[test]
    fn truncated_hash_is_quarantined() {
        let truncated = MD5_HASH.trim_end_matches("00");
        let contents = format!("{}\n{}\n", line("alice", truncated), line("bob", MD5_HASH));

        let inspection = inspect(&contents);

        assert_eq!(inspection.quarantined_count(), 1);
        assert_eq!(inspection.quarantined_lines, vec![line("alice", truncated)]);
        assert_eq!(inspection.document.render(), format!("{}\n", line("bob", MD5_HASH)));
    }

    #[test]
    fn whitespace_in_username_is_quarantined() {
        let inspection = inspect(&format!("\"ali ce\" \"{MD5_HASH}\"\n"));

        assert_eq!(
            inspection.findings.first().map(|finding| &finding.action),
            Some(&FindingAction::Quarantined {
                reason: QuarantineReason::InvalidUsername
            })
        );
        assert!(inspection.document.lines().is_empty());
    }

    #[test]
    fn identical_duplicates_collapse_and_conflicts_are_quarantined() {
        let contents = format!(
            "{}\n{}\n{}\n{}\n",
            line("alice", MD5_HASH),
            line("alice", MD5_HASH),
            line("bob", MD5_HASH),
            line("bob", &scram_hash()),
        );

        let inspection = inspect(&contents);

        assert_eq!(inspection.duplicates_dropped(), 1);
        assert_eq!(inspection.quarantined_count(), 2);
        assert_eq!(inspection.document.render(), format!("{}\n", line("alice", MD5_HASH)));
    }
}
