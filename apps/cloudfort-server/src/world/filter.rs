//! Save-relevant path predicate
//!
//! Decides which files of a world folder belong to the portable archive.
//! Paths are relative to the save root and may use either separator.

use regex::Regex;

/// Predicate over save-root-relative paths
pub trait SaveFilter: Send + Sync {
    fn is_save_file(&self, relative_path: &str) -> bool;
}

impl<F> SaveFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_save_file(&self, relative_path: &str) -> bool {
        self(relative_path)
    }
}

/// Stock Dwarf Fortress save allow-list
const DWARF_FORTRESS_PATTERNS: &[&str] = &[
    r"raw[/\\]graphics[/\\].*",
    r"raw[/\\]objects[/\\].*\.txt",
    r"art_image-\d*\.dat",
    r"feature-\d*\.dat",
    r"region_snapshot-\d*\.dat",
    r"site-\d*\.dat",
    r"unit-\d*\.dat",
    r"world\.dat",
    r"world\.sav",
];

/// Matches when any pattern is found anywhere in the path
#[derive(Debug, Clone)]
pub struct RegexSaveFilter {
    patterns: Vec<Regex>,
}

impl RegexSaveFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn dwarf_fortress() -> Self {
        let patterns = DWARF_FORTRESS_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("built-in save pattern is valid"))
            .collect();
        Self { patterns }
    }
}

impl Default for RegexSaveFilter {
    fn default() -> Self {
        Self::dwarf_fortress()
    }
}

impl SaveFilter for RegexSaveFilter {
    fn is_save_file(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(relative_path))
    }
}
