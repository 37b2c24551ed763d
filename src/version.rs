// src/version.rs

//! Version handling and range satisfaction for package requirements
//!
//! Package versions are not required to be strict semver ("1.0" and
//! "2.0.0-rc1" both occur in the wild), so parsing is lenient: versions
//! that parse as semver compare as semver, everything else falls back to
//! a normalized component comparison with a final string tie-break.
//!
//! Requirement versions may instead be a *range literal* in bracket
//! syntax, e.g. `[>=1.0 <2.0]`, resolved to a concrete version by the
//! version resolver before a node is created.

use crate::error::{Error, Result};
use semver::{Version as SemVersion, VersionReq};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A package version, or a range literal occupying the version slot of a
/// not-yet-resolved requirement reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version {
    original: String,
}

impl Version {
    /// Parse a version string
    ///
    /// Accepts plain versions ("1.0", "2.3.4-rc1") and bracketed range
    /// literals ("[>=1.0 <2.0]"). Empty strings are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("empty version string".to_string()));
        }
        if s.starts_with('[') {
            // Validate the range now so malformed literals fail early
            VersionRange::parse(s)?;
        }
        Ok(Self {
            original: s.to_string(),
        })
    }

    /// Whether this is a bracketed range literal rather than a concrete version
    pub fn is_range(&self) -> bool {
        self.original.starts_with('[')
    }

    /// The range literal as a parsed range, if this is one
    pub fn as_range(&self) -> Option<VersionRange> {
        if self.is_range() {
            VersionRange::parse(&self.original).ok()
        } else {
            None
        }
    }

    /// The version text as written
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Convert to a semver version for comparison
    ///
    /// Versions that are not semver-compliant are normalized by extracting
    /// numeric major.minor.patch components, defaulting missing ones to 0.
    /// Returns `None` only when the leading component is not numeric.
    fn to_semver(&self) -> Option<SemVersion> {
        if let Ok(v) = SemVersion::parse(&self.original) {
            return Some(v);
        }

        let base = self
            .original
            .split(['-', '+'])
            .next()
            .unwrap_or(&self.original);
        let parts: Vec<&str> = base.split('.').collect();
        let major = parts.first().and_then(|s| s.parse::<u64>().ok())?;
        let minor = parts.get(1).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let patch = parts.get(2).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        Some(SemVersion::new(major, minor, patch))
    }

    /// Compare two versions
    pub fn compare(&self, other: &Version) -> Ordering {
        match (self.to_semver(), other.to_semver()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.original.cmp(&other.original)),
            _ => self.original.cmp(&other.original),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.original.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

/// A version range in bracket syntax: `[>=1.0 <2.0]`
///
/// The inner expression is a space- or comma-separated comparator list
/// with semver comparison semantics.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    req: VersionReq,
}

impl VersionRange {
    /// Parse a bracketed range literal
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let inner = s
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(|| Error::ParseError(format!("version range '{}' must be bracketed", s)))?
            .trim();
        if inner.is_empty() {
            return Err(Error::ParseError(format!("empty version range '{}'", s)));
        }

        // Comparators may be separated by spaces or commas
        let normalized = inner
            .split([' ', ','])
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        let req = VersionReq::parse(&normalized)
            .map_err(|e| Error::ParseError(format!("invalid version range '{}': {}", s, e)))?;

        Ok(Self {
            raw: s.to_string(),
            req,
        })
    }

    /// Whether a concrete version satisfies this range
    pub fn satisfies(&self, version: &Version) -> bool {
        match version.to_semver() {
            Some(v) => self.req.matches(&v),
            None => false,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display_roundtrip() {
        assert_eq!(v("1.0").to_string(), "1.0");
        assert_eq!(v("2.3.4-rc1").to_string(), "2.3.4-rc1");
        assert!(Version::parse("").is_err());
        assert!(Version::parse("   ").is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.1") > v("1.0"));
        assert!(v("2.0") > v("1.9.9"));
        assert!(v("1.0") < v("1.0.1"));
        // Short and long forms of the same number compare by text as tie-break
        assert_ne!(v("1.0"), v("1.0.0"));
        // Non-numeric versions fall back to string comparison
        assert!(v("beta2") > v("beta1"));
    }

    #[test]
    fn test_range_detection() {
        assert!(v("[>=1.0 <2.0]").is_range());
        assert!(!v("1.0").is_range());
        assert!(v("[>=1.0 <2.0]").as_range().is_some());
        assert!(v("1.0").as_range().is_none());
    }

    #[test]
    fn test_range_satisfaction() {
        let range = VersionRange::parse("[>=1.0 <2.0]").unwrap();
        assert!(range.satisfies(&v("1.0")));
        assert!(range.satisfies(&v("1.1")));
        assert!(range.satisfies(&v("1.9.9")));
        assert!(!range.satisfies(&v("2.0")));
        assert!(!range.satisfies(&v("0.9")));
    }

    #[test]
    fn test_range_comma_separator() {
        let range = VersionRange::parse("[>=1.0, <2.0]").unwrap();
        assert!(range.satisfies(&v("1.5")));
        assert!(!range.satisfies(&v("2.1")));
    }

    #[test]
    fn test_single_bound_range() {
        let range = VersionRange::parse("[>=2.0]").unwrap();
        assert!(range.satisfies(&v("2.0")));
        assert!(range.satisfies(&v("3.7")));
        assert!(!range.satisfies(&v("1.9")));
    }

    #[test]
    fn test_malformed_ranges() {
        assert!(VersionRange::parse(">=1.0").is_err());
        assert!(VersionRange::parse("[]").is_err());
        assert!(VersionRange::parse("[>=x.y]").is_err());
        assert!(Version::parse("[not a range").is_err());
    }
}
