//! Compiled ignore rules for tree traversal.
//!
//! A rule set combines a `|`-separated list of glob patterns with two exact
//! sets of root-relative paths (files and folders). Globs are anchored to the
//! whole relative path: `*` matches any run of characters (including `/`),
//! `?` matches exactly one character, everything else is literal.

use regex::Regex;
use std::collections::HashSet;

/// Separator used for every root-relative path handed out by the traversal.
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    pattern: Option<Regex>,
    files: HashSet<String>,
    folders: HashSet<String>,
}

impl IgnoreRules {
    /// Build a rule set. Empty alternatives in `patterns` are dropped.
    pub fn new<F, D>(patterns: &str, files: F, folders: D) -> Result<Self, regex::Error>
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let alternatives: Vec<String> = patterns
            .split('|')
            .filter(|p| !p.is_empty())
            .map(glob_to_regex)
            .collect();

        let pattern = if alternatives.is_empty() {
            None
        } else {
            Some(Regex::new(&format!("^(?:{})$", alternatives.join("|")))?)
        };

        Ok(Self {
            pattern,
            files: files.into_iter().map(|f| normalize(f.as_ref())).collect(),
            folders: folders.into_iter().map(|f| normalize(f.as_ref())).collect(),
        })
    }

    /// A rule set that ignores nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add an exact file path to the ignored set.
    pub fn ignore_file(&mut self, relative_path: &str) {
        self.files.insert(normalize(relative_path));
    }

    /// True if the glob alternation matches the whole relative path.
    pub fn matches(&self, relative_path: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|re| re.is_match(relative_path))
    }

    pub fn is_file_ignored(&self, relative_path: &str) -> bool {
        self.matches(relative_path) || self.files.contains(relative_path)
    }

    pub fn is_folder_ignored(&self, relative_path: &str) -> bool {
        self.matches(relative_path) || self.folders.contains(relative_path)
    }

    /// True if `relative_path` is an ignored folder or lies anywhere beneath
    /// one. The traversal never descends into such folders, so existence
    /// probes must treat everything below them as absent.
    pub fn is_under_ignored_folder(&self, relative_path: &str) -> bool {
        ancestors(relative_path).any(|prefix| self.is_folder_ignored(prefix))
    }
}

/// Normalize a configured path to the traversal's relative form.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .trim_matches(SEPARATOR)
        .to_string()
}

/// Join a parent relative path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{SEPARATOR}{name}")
    }
}

/// Every non-empty prefix of `path` ending at a separator, plus `path` itself.
/// `"a/b/c"` yields `"a"`, `"a/b"`, `"a/b/c"`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|(_, c)| *c == SEPARATOR)
        .map(move |(i, _)| &path[..i])
        .chain(std::iter::once(path))
        .filter(|p| !p.is_empty())
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out
}
