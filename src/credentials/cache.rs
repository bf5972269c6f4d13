//! Credential cache model
//!
//! Each entry line is `"<username>" "<secretHash>"`, separated by one space. Parsing is total:
//! lines that do not match the grammar are kept as [`CacheLine::Unparsed`] so that a rewrite
//! touching one entry never loses the others.

use std::cmp::Ordering;

use serde::Serialize;

use crate::{credentials::repair, identity::RoleName, secrets::SecretHash};

/// One `(username, secretHash)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    /// Login role.
    pub username: RoleName,

    /// Current secret hash.
    pub secret_hash: SecretHash,
}

impl CacheEntry {
    /// Parse a line in the strict grammar.
    #[must_use]
    pub fn parse_strict(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('"')?;
        let (username, rest) = rest.split_once("\" \"")?;
        let secret_hash = rest.strip_suffix('"')?;

        if secret_hash.contains('"') {
            return None;
        }

        Some(Self {
            username: RoleName::parse(username).ok()?,
            secret_hash: SecretHash::parse(secret_hash).ok()?,
        })
    }

    /// Render in the strict grammar.
    #[must_use]
    pub fn render(&self) -> String {
        format!("\"{}\" \"{}\"", self.username, self.secret_hash.as_str())
    }
}

/// One line of the cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLine {
    /// Well-formed entry.
    Entry(CacheEntry),

    /// Comment or blank line, kept verbatim.
    Other(String),

    /// Line that does not match the grammar, kept verbatim until repaired.
    Unparsed(String),
}

impl CacheLine {
    /// Classify a single line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            return Self::Other(line.to_string());
        }

        CacheEntry::parse_strict(line).map_or_else(|| Self::Unparsed(line.to_string()), Self::Entry)
    }

    /// Whether this line is a malformed entry for `username`.
    fn is_stale_entry_for(&self, username: &RoleName) -> bool {
        match self {
            Self::Unparsed(raw) => {
                repair::claimed_username(raw).as_deref() == Some(username.as_str())
            }
            Self::Entry(_) | Self::Other(_) => false,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Entry(entry) => entry.render(),
            Self::Other(raw) | Self::Unparsed(raw) => raw.clone(),
        }
    }
}

/// Effect of an incremental change on one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryChange {
    /// Entry was added.
    Added,

    /// Entry's hash was replaced.
    Updated,

    /// Entry was removed.
    Removed,

    /// Nothing changed.
    Unchanged,
}

/// Parsed credential cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDocument {
    lines: Vec<CacheLine>,
}

impl CacheDocument {
    /// Parse file contents. Never fails.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        Self {
            lines: contents.lines().map(CacheLine::parse).collect(),
        }
    }

    /// Canonical document holding exactly `entries`, ordered by username.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut entries: Vec<CacheEntry> = entries.into_iter().collect();

        entries.sort_by(|a, b| a.username.cmp(&b.username));
        entries.dedup_by(|a, b| a.username == b.username);

        Self {
            lines: entries.into_iter().map(CacheLine::Entry).collect(),
        }
    }

    pub(crate) fn from_lines(lines: Vec<CacheLine>) -> Self {
        Self { lines }
    }

    /// All lines.
    #[must_use]
    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    /// Well-formed entries in file order.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.lines.iter().filter_map(|line| match line {
            CacheLine::Entry(entry) => Some(entry),
            CacheLine::Other(_) | CacheLine::Unparsed(_) => None,
        })
    }

    /// First entry for `username`.
    #[must_use]
    pub fn entry(&self, username: &RoleName) -> Option<&CacheEntry> {
        self.entries().find(|entry| entry.username == *username)
    }

    /// Number of lines that do not match the grammar.
    #[must_use]
    pub fn unparsed_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, CacheLine::Unparsed(_)))
            .count()
    }

    /// Set the entry for `entry.username`, leaving every other user's lines untouched.
    ///
    /// Malformed lines for the same user are dropped. New entries go before the first entry
    /// with a greater username, so a document built by [`Self::from_entries`] stays canonical.
    pub fn upsert(&mut self, entry: CacheEntry) -> EntryChange {
        let stale = self.drop_stale_entries(&entry.username);
        let indices: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| match line {
                CacheLine::Entry(existing) if existing.username == entry.username => Some(index),
                CacheLine::Entry(_) | CacheLine::Other(_) | CacheLine::Unparsed(_) => None,
            })
            .collect();

        let Some((&first, duplicates)) = indices.split_first() else {
            let position = self
                .lines
                .iter()
                .position(|line| match line {
                    CacheLine::Entry(existing) => {
                        existing.username.cmp(&entry.username) == Ordering::Greater
                    }
                    CacheLine::Other(_) | CacheLine::Unparsed(_) => false,
                })
                .unwrap_or(self.lines.len());

            self.lines.insert(position, CacheLine::Entry(entry));

            return if stale {
                EntryChange::Updated
            } else {
                EntryChange::Added
            };
        };

        let mut change = if stale {
            EntryChange::Updated
        } else {
            EntryChange::Unchanged
        };

        if let Some(CacheLine::Entry(existing)) = self.lines.get_mut(first)
            && existing.secret_hash != entry.secret_hash
        {
            existing.secret_hash = entry.secret_hash;
            change = EntryChange::Updated;
        }

        for &index in duplicates.iter().rev() {
            self.lines.remove(index);
            change = EntryChange::Updated;
        }

        change
    }

    /// Remove every entry for `username`, malformed ones included.
    pub fn remove(&mut self, username: &RoleName) -> EntryChange {
        let before = self.lines.len();

        self.lines.retain(|line| match line {
            CacheLine::Entry(entry) => entry.username != *username,
            CacheLine::Other(_) => true,
            CacheLine::Unparsed(_) => !line.is_stale_entry_for(username),
        });

        if self.lines.len() == before {
            EntryChange::Unchanged
        } else {
            EntryChange::Removed
        }
    }

    fn drop_stale_entries(&mut self, username: &RoleName) -> bool {
        let before = self.lines.len();

        self.lines.retain(|line| !line.is_stale_entry_for(username));

        self.lines.len() != before
    }

    /// Serialize, one line per entry, newline-terminated.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::secrets::tests::{MD5_HASH, scram_hash};

    pub(crate) fn entry(username: &str, hash: &str) -> TestResult<CacheEntry> {
        Ok(CacheEntry {
            username: RoleName::parse(username)?,
            secret_hash: SecretHash::parse(hash)?,
        })
    }

    #[test]
    fn strict_grammar_requires_single_space_and_quotes() {
        assert!(CacheEntry::parse_strict(&format!("\"alice\" \"{MD5_HASH}\"")).is_some());
        assert!(CacheEntry::parse_strict(&format!("\"alice\"  \"{MD5_HASH}\"")).is_none());
        assert!(CacheEntry::parse_strict(&format!("alice \"{MD5_HASH}\"")).is_none());
        assert!(CacheEntry::parse_strict(&format!(" \"alice\" \"{MD5_HASH}\"")).is_none());
        assert!(CacheEntry::parse_strict("\"alice\" \"md5abc\"").is_none());
    }

    #[test]
    fn parsing_keeps_comments_and_garbage() {
        let document = CacheDocument::parse(&format!(
            ";; pooler users\n\"alice\" \"{MD5_HASH}\"\ngarbage line\n\n"
        ));

        assert_eq!(document.lines().len(), 4);
        assert_eq!(document.entries().count(), 1);
        assert_eq!(document.unparsed_count(), 1);
        assert_eq!(
            document.render(),
            format!(";; pooler users\n\"alice\" \"{MD5_HASH}\"\ngarbage line\n\n")
        );
    }

    #[test]
    fn upsert_inserts_in_order_and_updates_in_place() -> TestResult {
        let mut document =
            CacheDocument::from_entries([entry("carol", MD5_HASH)?, entry("alice", MD5_HASH)?]);

        assert_eq!(document.upsert(entry("bob", MD5_HASH)?), EntryChange::Added);
        assert_eq!(document.upsert(entry("bob", &scram_hash())?), EntryChange::Updated);
        assert_eq!(document.upsert(entry("bob", &scram_hash())?), EntryChange::Unchanged);

        let expected = CacheDocument::from_entries([
            entry("alice", MD5_HASH)?,
            entry("bob", &scram_hash())?,
            entry("carol", MD5_HASH)?,
        ]);

        assert_eq!(document, expected);

        Ok(())
    }

    #[test]
    fn remove_reports_whether_anything_changed() -> TestResult {
        let mut document = CacheDocument::from_entries([entry("alice", MD5_HASH)?]);
        let alice = RoleName::parse("alice")?;

        assert_eq!(document.remove(&alice), EntryChange::Removed);
        assert_eq!(document.remove(&alice), EntryChange::Unchanged);
        assert_eq!(document.render(), "");

        Ok(())
    }

    #[test]
    fn upsert_replaces_malformed_lines_for_the_same_user() -> TestResult {
        let mut document = CacheDocument::parse(&format!(
            "\"alice\"  \"{MD5_HASH}\"\n\"bob\" \"{MD5_HASH}\"\ngarbage line\n"
        ));

        assert_eq!(document.upsert(entry("alice", &scram_hash())?), EntryChange::Updated);
        assert_eq!(
            document.render(),
            format!(
                "\"alice\" \"{}\"\n\"bob\" \"{MD5_HASH}\"\ngarbage line\n",
                scram_hash()
            )
        );

        Ok(())
    }

    #[test]
    fn remove_drops_malformed_lines_for_the_user() -> TestResult {
        let mut document = CacheDocument::parse(&format!(
            "alice {MD5_HASH}\n\"bob\" \"{MD5_HASH}\"\n\"carol\" \"md5abc\"\n"
        ));

        assert_eq!(document.remove(&RoleName::parse("alice")?), EntryChange::Removed);
        assert_eq!(document.remove(&RoleName::parse("carol")?), EntryChange::Removed);
        assert_eq!(document.render(), format!("\"bob\" \"{MD5_HASH}\"\n"));

        Ok(())
    }

    #[test]
    fn debug_does_not_leak_hash() -> TestResult {
        let entry = entry("alice", MD5_HASH)?;

        assert!(!format!("{entry:?}").contains("c0ffee"));

        Ok(())
    }
}
