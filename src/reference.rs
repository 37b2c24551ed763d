// src/reference.rs

//! Reference types: the normalized identity of recipes and packages
//!
//! A *recipe reference* is `name/version[@user[/channel]][#rrev]` where
//! `rrev` is the content hash of the recipe export tree. A *package
//! reference* extends it with the package id (hash of the build
//! configuration) and optionally the package revision (content hash of
//! the built tree): `name/version@user/channel#rrev:pkgid[#prev]`.
//!
//! References are value types and freely shared. A package revision
//! requires a package id, which requires a recipe revision; the
//! constructors enforce this.

use crate::error::{Error, Result};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ParseError("reference has an empty name".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
    {
        return Err(Error::ParseError(format!(
            "invalid character in package name '{}'",
            name
        )));
    }
    Ok(())
}

/// Identity of a recipe: name, version, optional user/channel namespace,
/// optional recipe revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeReference {
    pub name: String,
    pub version: Version,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub revision: Option<String>,
}

impl RecipeReference {
    /// Build a reference without user/channel or revision
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            user: None,
            channel: None,
            revision: None,
        }
    }

    /// Parse `name/version[@user[/channel]][#rrev]`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (body, revision) = match text.split_once('#') {
            Some((body, rrev)) if !rrev.is_empty() => (body, Some(rrev.to_string())),
            Some((_, _)) => {
                return Err(Error::ParseError(format!("empty revision in '{}'", text)))
            }
            None => (text, None),
        };

        let (path, namespace) = match body.split_once('@') {
            Some((path, ns)) => (path, Some(ns)),
            None => (body, None),
        };

        let (name, version) = path.split_once('/').ok_or_else(|| {
            Error::ParseError(format!("reference '{}' must look like name/version", text))
        })?;
        validate_name(name)?;
        let version = Version::parse(version)?;

        let (user, channel) = match namespace {
            None => (None, None),
            Some(ns) => match ns.split_once('/') {
                Some((user, channel)) => {
                    if user.is_empty() || channel.is_empty() {
                        return Err(Error::ParseError(format!(
                            "empty user or channel in '{}'",
                            text
                        )));
                    }
                    (Some(user.to_string()), Some(channel.to_string()))
                }
                None => {
                    if ns.is_empty() {
                        return Err(Error::ParseError(format!("empty user in '{}'", text)));
                    }
                    (Some(ns.to_string()), None)
                }
            },
        };

        Ok(Self {
            name: name.to_string(),
            version,
            user,
            channel,
            revision,
        })
    }

    /// The reference without its revision: `name/version[@user[/channel]]`
    ///
    /// This is the exact form stored in the cache database's `reference`
    /// column and the key used for diamond matching.
    pub fn base_str(&self) -> String {
        let mut s = format!("{}/{}", self.name, self.version);
        if let Some(user) = &self.user {
            s.push('@');
            s.push_str(user);
            if let Some(channel) = &self.channel {
                s.push('/');
                s.push_str(channel);
            }
        }
        s
    }

    /// The full reference including the revision when pinned
    pub fn full_str(&self) -> String {
        match &self.revision {
            Some(rrev) => format!("{}#{}", self.base_str(), rrev),
            None => self.base_str(),
        }
    }

    /// Same reference with the revision dropped
    pub fn without_revision(&self) -> Self {
        Self {
            revision: None,
            ..self.clone()
        }
    }

    /// Same reference pinned to the given revision
    pub fn with_revision(&self, rrev: impl Into<String>) -> Self {
        Self {
            revision: Some(rrev.into()),
            ..self.clone()
        }
    }

    /// Whether two references name the same package identity
    /// (name + user + channel), ignoring version and revision.
    pub fn same_identity(&self, other: &RecipeReference) -> bool {
        self.name == other.name && self.user == other.user && self.channel == other.channel
    }
}

impl fmt::Display for RecipeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_str())
    }
}

impl FromStr for RecipeReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RecipeReference::parse(s)
    }
}

impl PartialOrd for RecipeReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecipeReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.user.cmp(&other.user))
            .then_with(|| self.channel.cmp(&other.channel))
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

/// Identity of a built package: a pinned recipe reference plus the
/// package id and optionally the package revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub recipe: RecipeReference,
    pub package_id: String,
    pub revision: Option<String>,
}

impl PackageReference {
    /// Build a package reference; the recipe reference must be pinned to
    /// a recipe revision.
    pub fn new(recipe: RecipeReference, package_id: impl Into<String>) -> Result<Self> {
        if recipe.revision.is_none() {
            return Err(Error::ParseError(format!(
                "package reference for '{}' requires a recipe revision",
                recipe.base_str()
            )));
        }
        let package_id = package_id.into();
        if package_id.is_empty() {
            return Err(Error::ParseError(format!(
                "empty package id for '{}'",
                recipe
            )));
        }
        Ok(Self {
            recipe,
            package_id,
            revision: None,
        })
    }

    /// Parse `name/version[@user/channel]#rrev:pkgid[#prev]`
    pub fn parse(text: &str) -> Result<Self> {
        let (recipe_part, pkg_part) = text.split_once(':').ok_or_else(|| {
            Error::ParseError(format!("package reference '{}' is missing ':pkgid'", text))
        })?;

        let recipe = RecipeReference::parse(recipe_part)?;
        let (package_id, revision) = match pkg_part.split_once('#') {
            Some((pkgid, prev)) if !prev.is_empty() => (pkgid, Some(prev.to_string())),
            Some((_, _)) => {
                return Err(Error::ParseError(format!(
                    "empty package revision in '{}'",
                    text
                )))
            }
            None => (pkg_part, None),
        };

        let mut pref = Self::new(recipe, package_id)?;
        pref.revision = revision;
        Ok(pref)
    }

    /// The full reference including the package revision when pinned
    pub fn full_str(&self) -> String {
        match &self.revision {
            Some(prev) => format!("{}:{}#{}", self.recipe.full_str(), self.package_id, prev),
            None => format!("{}:{}", self.recipe.full_str(), self.package_id),
        }
    }

    /// Same reference pinned to the given package revision
    pub fn with_revision(&self, prev: impl Into<String>) -> Self {
        Self {
            revision: Some(prev.into()),
            ..self.clone()
        }
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_str())
    }
}

/// The flattened row key used by the cache database:
/// `(reference, rrev, pkgid?, prev?)`.
///
/// Recipe rows have `pkgid` and `prev` as `None`; equality treats `None`
/// as distinct from any value, matching the NULL semantics of the
/// database's unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheReference {
    pub reference: String,
    pub rrev: String,
    pub pkgid: Option<String>,
    pub prev: Option<String>,
}

impl CacheReference {
    /// Row key for a pinned recipe reference
    pub fn from_recipe(r: &RecipeReference) -> Result<Self> {
        let rrev = r.revision.clone().ok_or_else(|| {
            Error::ParseError(format!(
                "cannot index '{}' without a recipe revision",
                r.base_str()
            ))
        })?;
        Ok(Self {
            reference: r.base_str(),
            rrev,
            pkgid: None,
            prev: None,
        })
    }

    /// Row key for a package reference (package revision may be absent)
    pub fn from_package(p: &PackageReference) -> Result<Self> {
        let mut key = Self::from_recipe(&p.recipe)?;
        key.pkgid = Some(p.package_id.clone());
        key.prev = p.revision.clone();
        Ok(key)
    }

    /// Human-readable form for error messages
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}#{}", self.reference, self.rrev);
        if let Some(pkgid) = &self.pkgid {
            s.push(':');
            s.push_str(pkgid);
            if let Some(prev) = &self.prev {
                s.push('#');
                s.push_str(prev);
            }
        }
        s
    }

    /// Reconstruct the recipe reference this row key was derived from
    pub fn to_recipe_ref(&self) -> Result<RecipeReference> {
        Ok(RecipeReference::parse(&self.reference)?.with_revision(&self.rrev))
    }
}

impl fmt::Display for CacheReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let r = RecipeReference::parse("zlib/1.2.11").unwrap();
        assert_eq!(r.name, "zlib");
        assert_eq!(r.version.to_string(), "1.2.11");
        assert!(r.user.is_none());
        assert!(r.channel.is_none());
        assert!(r.revision.is_none());
        assert_eq!(r.to_string(), "zlib/1.2.11");
    }

    #[test]
    fn test_parse_full() {
        let r = RecipeReference::parse("boost/1.79.0@conicorp/stable#abc123").unwrap();
        assert_eq!(r.name, "boost");
        assert_eq!(r.user.as_deref(), Some("conicorp"));
        assert_eq!(r.channel.as_deref(), Some("stable"));
        assert_eq!(r.revision.as_deref(), Some("abc123"));
        assert_eq!(r.base_str(), "boost/1.79.0@conicorp/stable");
        assert_eq!(r.full_str(), "boost/1.79.0@conicorp/stable#abc123");
    }

    #[test]
    fn test_parse_user_without_channel() {
        let r = RecipeReference::parse("fmt/9.0.0@team").unwrap();
        assert_eq!(r.user.as_deref(), Some("team"));
        assert!(r.channel.is_none());
        assert_eq!(r.base_str(), "fmt/9.0.0@team");
    }

    #[test]
    fn test_parse_range_version() {
        let r = RecipeReference::parse("zlib/[>=1.2 <2.0]").unwrap();
        assert!(r.version.is_range());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RecipeReference::parse("justaname").is_err());
        assert!(RecipeReference::parse("/1.0").is_err());
        assert!(RecipeReference::parse("pkg/1.0#").is_err());
        assert!(RecipeReference::parse("pkg/1.0@").is_err());
        assert!(RecipeReference::parse("pkg/1.0@user/").is_err());
        assert!(RecipeReference::parse("bad name/1.0").is_err());
    }

    #[test]
    fn test_same_identity() {
        let a = RecipeReference::parse("zlib/1.0").unwrap();
        let b = RecipeReference::parse("zlib/2.0#rrev").unwrap();
        let c = RecipeReference::parse("zlib/1.0@user/stable").unwrap();
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn test_package_reference_roundtrip() {
        let p = PackageReference::parse("zlib/1.2.11#rrev1:pkgid1#prev1").unwrap();
        assert_eq!(p.recipe.name, "zlib");
        assert_eq!(p.recipe.revision.as_deref(), Some("rrev1"));
        assert_eq!(p.package_id, "pkgid1");
        assert_eq!(p.revision.as_deref(), Some("prev1"));
        assert_eq!(p.full_str(), "zlib/1.2.11#rrev1:pkgid1#prev1");
    }

    #[test]
    fn test_package_reference_requires_rrev() {
        let unpinned = RecipeReference::parse("zlib/1.0").unwrap();
        assert!(PackageReference::new(unpinned, "pkgid").is_err());
        assert!(PackageReference::parse("zlib/1.0:pkgid").is_err());
    }

    #[test]
    fn test_cache_reference_null_distinctness() {
        let recipe = RecipeReference::parse("zlib/1.0#r1").unwrap();
        let recipe_key = CacheReference::from_recipe(&recipe).unwrap();

        let pref = PackageReference::new(recipe, "p1").unwrap();
        let pkg_key = CacheReference::from_package(&pref).unwrap();
        let pinned_key = CacheReference::from_package(&pref.with_revision("prev1")).unwrap();

        assert_ne!(recipe_key, pkg_key);
        assert_ne!(pkg_key, pinned_key);
        assert_eq!(pkg_key.pkgid.as_deref(), Some("p1"));
        assert!(pkg_key.prev.is_none());
    }

    #[test]
    fn test_cache_reference_roundtrip() {
        let r = RecipeReference::parse("pkg/1.0@u/c#rrev").unwrap();
        let key = CacheReference::from_recipe(&r).unwrap();
        assert_eq!(key.to_recipe_ref().unwrap(), r);
        assert_eq!(key.full_reference(), "pkg/1.0@u/c#rrev");
    }

    #[test]
    fn test_ordering() {
        let a = RecipeReference::parse("alib/1.0").unwrap();
        let b = RecipeReference::parse("alib/2.0").unwrap();
        let c = RecipeReference::parse("blib/1.0").unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
