//! Config file resolution and the static lookup tables sessions consult.

use crate::error::{Result, WardenError};
use shared::{Format, ParseError};
use std::collections::HashMap;
use std::str::FromStr;

/// Non-empty and word characters only, so it can't leave the configs root.
fn is_word(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves the league config for a map, e.g. `ugc/koth_highlander.cfg`.
pub fn config_name(map: &str, format: Format, ruleset: &str) -> Result<String> {
    if !is_word(map) {
        return Err(WardenError::InvalidMapName(map.to_string()));
    }
    if !is_word(ruleset) {
        return Err(WardenError::InvalidLeague(ruleset.to_string()));
    }

    let map_type = if map.starts_with("ultiduo") {
        "koth"
    } else {
        match map.split_once('_') {
            Some((prefix, _)) if !prefix.is_empty() => prefix,
            _ => return Err(WardenError::InvalidMapName(map.to_string())),
        }
    };

    Ok(format!("{}/{}_{}.cfg", ruleset, map_type, format.name()))
}

pub fn format_config_name(format: Format) -> String {
    format!("formats/{}.cfg", format.name())
}

/// Cuts a line at the first `//`.
pub fn strip_comments(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Commands in a config file, comments and blank lines removed.
pub fn config_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(|line| strip_comments(line).trim())
        .filter(|line| !line.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    Exact,
    Prefix,
}

/// Maps a whitelist id onto a whitelist file shipped with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistRule {
    pub matching: RuleMatch,
    pub pattern: String,
    pub file: String,
}

impl WhitelistRule {
    fn matches(&self, id: &str) -> bool {
        match self.matching {
            RuleMatch::Exact => id == self.pattern,
            RuleMatch::Prefix => id.starts_with(&self.pattern),
        }
    }
}

impl FromStr for WhitelistRule {
    type Err = ParseError;

    /// Parses `prefix:<pattern>=<file>` or `exact:<pattern>=<file>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || ParseError(format!("bad whitelist rule: {}", s));
        let (kind, rest) = s.split_once(':').ok_or_else(bad)?;
        let (pattern, file) = rest.split_once('=').ok_or_else(bad)?;
        let matching = match kind {
            "exact" => RuleMatch::Exact,
            "prefix" => RuleMatch::Prefix,
            _ => return Err(bad()),
        };
        if pattern.is_empty() || file.is_empty() {
            return Err(bad());
        }
        Ok(WhitelistRule {
            matching,
            pattern: pattern.to_string(),
            file: file.to_string(),
        })
    }
}

/// Fallback used when the server has no whitelist plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistTable {
    rules: Vec<WhitelistRule>,
}

impl WhitelistTable {
    pub fn new(rules: Vec<WhitelistRule>) -> Self {
        Self { rules }
    }

    /// First matching rule wins.
    pub fn lookup(&self, id: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(id))
            .map(|rule| rule.file.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for WhitelistTable {
    fn default() -> Self {
        let rule = |matching, pattern: &str, file: &str| WhitelistRule {
            matching,
            pattern: pattern.to_string(),
            file: file.to_string(),
        };
        Self::new(vec![
            rule(RuleMatch::Prefix, "etf2l_9v9", "etf2l_whitelist_9v9.txt"),
            rule(RuleMatch::Prefix, "etf2l_6v6", "etf2l_whitelist_6v6.txt"),
            rule(RuleMatch::Exact, "etf2l_ultiduo", "etf2l_whitelist_ultiduo.txt"),
            rule(RuleMatch::Exact, "etf2l_bball", "etf2l_whitelist_bball.txt"),
            rule(RuleMatch::Prefix, "ugc_9v9", "item_whitelist_ugc_HL.txt"),
            rule(RuleMatch::Prefix, "ugc_6v6", "item_whitelist_ugc_6v6.txt"),
            rule(RuleMatch::Prefix, "ugc_4v4", "item_whitelist_ugc_4v4.txt"),
            rule(RuleMatch::Prefix, "esea_6v6", "esea/item_whitelist.txt"),
        ])
    }
}

/// `!rep` votes needed to substitute a player, per format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumTable {
    quorum: HashMap<Format, usize>,
}

impl QuorumTable {
    pub fn get(&self, format: Format) -> usize {
        self.quorum.get(&format).copied().unwrap_or(2)
    }

    pub fn set(&mut self, format: Format, votes: usize) {
        self.quorum.insert(format, votes.max(1));
    }
}

impl Default for QuorumTable {
    fn default() -> Self {
        let quorum = HashMap::from([
            (Format::Sixes, 5),
            (Format::Highlander, 6),
            (Format::Fours, 3),
            (Format::Ultiduo, 2),
            (Format::Bball, 2),
            (Format::Debug, 2),
        ]);
        Self { quorum }
    }
}

/// A `format=votes` override from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumOverride {
    pub format: Format,
    pub votes: usize,
}

impl FromStr for QuorumOverride {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (format, votes) = s
            .split_once('=')
            .ok_or_else(|| ParseError(format!("expected format=votes, got {}", s)))?;
        let votes = votes
            .trim()
            .parse()
            .map_err(|_| ParseError(format!("bad vote count in {}", s)))?;
        Ok(QuorumOverride {
            format: format.parse()?,
            votes,
        })
    }
}
