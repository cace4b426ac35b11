// src/version.rs

//! Package version comparison and `fromversion` range evaluation
//!
//! Versions are compared component-wise. A version string is split on
//! `.`, `-`, `_` and `+`; each segment is further split into digit runs and
//! qualifier runs (`dev`, `alpha`, `beta`, `rc`, `pl` and their short forms).
//! Qualifiers sort below a plain numeric component, except `pl` which sorts
//! above it, so `1.0.0 RC 1 < 1.0.0 < 1.0.0 pl 1 < 1.0.1`.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+(\.[a-zA-Z0-9_-]+)+$")
        .expect("package name pattern is valid")
});

static MANIFEST_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([0-9]+)\.([0-9]+)\.([0-9]+)( (a|alpha|b|beta|d|dev|rc|pl) ([0-9]+))?$")
        .expect("version pattern is valid")
});

/// Returns true if `name` is a valid package identifier (e.g. `com.example.plugin`)
pub fn is_valid_package_name(name: &str) -> bool {
    PACKAGE_NAME.is_match(name)
}

/// Returns true if `version` is valid for a package manifest
pub fn is_valid_version(version: &str) -> bool {
    MANIFEST_VERSION.is_match(version)
}

/// Last segment of a package identifier, used as an application abbreviation
pub fn abbreviation(package: &str) -> &str {
    package.rsplit('.').next().unwrap_or(package)
}

/// Pre-release and post-release markers, in ascending order.
///
/// `Release` never comes from text; it is the rank a numeric component takes
/// when compared against a qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Qualifier {
    Dev,
    Alpha,
    Beta,
    ReleaseCandidate,
    Release,
    PatchLevel,
}

impl Qualifier {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "dev" | "d" => Some(Qualifier::Dev),
            "alpha" | "a" => Some(Qualifier::Alpha),
            "beta" | "b" => Some(Qualifier::Beta),
            "rc" => Some(Qualifier::ReleaseCandidate),
            "pl" | "p" => Some(Qualifier::PatchLevel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Number(u64),
    Qualifier(Qualifier),
}

/// A tokenized version, ordered by [`compare`] semantics
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    parts: Vec<Part>,
}

impl Version {
    /// Tokenize a version string
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(Error::InvalidVersionFormat(raw.to_string()));
        }

        let mut parts = Vec::new();
        for segment in normalized.split(['.', '-', '_', '+']) {
            if segment.is_empty() {
                return Err(Error::InvalidVersionFormat(raw.to_string()));
            }

            let mut rest = segment;
            while let Some(first) = rest.chars().next() {
                let is_digit = first.is_ascii_digit();
                let end = rest
                    .find(|c: char| c.is_ascii_digit() != is_digit)
                    .unwrap_or(rest.len());
                let (token, tail) = rest.split_at(end);

                let part = if is_digit {
                    token
                        .parse::<u64>()
                        .map(Part::Number)
                        .map_err(|_| Error::InvalidVersionFormat(raw.to_string()))?
                } else {
                    Qualifier::parse(token)
                        .map(Part::Qualifier)
                        .ok_or_else(|| Error::InvalidVersionFormat(raw.to_string()))?
                };

                parts.push(part);
                rest = tail;
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The version string as it was given
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let ordering = match (self.parts.get(i), other.parts.get(i)) {
                (Some(a), Some(b)) => compare_parts(*a, *b),
                (Some(a), None) => compare_with_missing(*a),
                (None, Some(b)) => compare_with_missing(*b).reverse(),
                (None, None) => Ordering::Equal,
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    }
}

fn compare_parts(a: Part, b: Part) -> Ordering {
    match (a, b) {
        (Part::Number(x), Part::Number(y)) => x.cmp(&y),
        (Part::Number(_), Part::Qualifier(q)) => Qualifier::Release.cmp(&q),
        (Part::Qualifier(q), Part::Number(_)) => q.cmp(&Qualifier::Release),
        (Part::Qualifier(p), Part::Qualifier(q)) => p.cmp(&q),
    }
}

/// Ordering of a trailing component against the end of a shorter version
fn compare_with_missing(part: Part) -> Ordering {
    match part {
        Part::Number(_) => Ordering::Greater,
        Part::Qualifier(q) => q.cmp(&Qualifier::Release),
    }
}

/// Compare two version strings
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

/// Comparison operators accepted in `fromversion` clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    GreaterOrEqual,
    Greater,
    LessOrEqual,
    Less,
    Equal,
}

impl Operator {
    fn split(clause: &str) -> (Self, &str) {
        for (prefix, op) in [
            (">=", Operator::GreaterOrEqual),
            ("<=", Operator::LessOrEqual),
            ("==", Operator::Equal),
            (">", Operator::Greater),
            ("<", Operator::Less),
            ("=", Operator::Equal),
        ] {
            if let Some(rest) = clause.strip_prefix(prefix) {
                return (op, rest.trim());
            }
        }

        (Operator::Equal, clause)
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Operator::GreaterOrEqual => ordering != Ordering::Less,
            Operator::Greater => ordering == Ordering::Greater,
            Operator::LessOrEqual => ordering != Ordering::Greater,
            Operator::Less => ordering == Ordering::Less,
            Operator::Equal => ordering == Ordering::Equal,
        }
    }
}

/// A parsed `fromversion` selector
#[derive(Debug, Clone)]
pub enum VersionRange {
    /// `1.0.*`: case-insensitive wildcard over the raw version string
    Wildcard(Regex),
    /// `>=1.0.0, <2.0.0`: every clause must hold
    Clauses(Vec<(Operator, Version)>),
}

impl VersionRange {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(Error::InvalidVersionFormat(expr.to_string()));
        }

        if expr.contains('*') {
            let pattern = expr
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("(?i)^{}$", pattern))
                .map_err(|_| Error::InvalidVersionFormat(expr.to_string()))?;
            return Ok(VersionRange::Wildcard(regex));
        }

        let clauses = expr
            .split(',')
            .map(|clause| {
                let (op, version) = Operator::split(clause.trim());
                Ok((op, Version::parse(version)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(VersionRange::Clauses(clauses))
    }

    /// Whether `version` lies inside this range
    pub fn contains(&self, version: &Version) -> bool {
        match self {
            VersionRange::Wildcard(regex) => regex.is_match(version.as_str()),
            VersionRange::Clauses(clauses) => clauses
                .iter()
                .all(|(op, bound)| op.holds(version.cmp(bound))),
        }
    }
}

/// Evaluate a `fromversion` expression against an installed version
pub fn satisfies_range(version: &str, range_expr: &str) -> Result<bool> {
    let version = Version::parse(version)?;
    Ok(VersionRange::parse(range_expr)?.contains(&version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &str, b: &str) -> Ordering {
        compare(a, b).unwrap()
    }

    #[test]
    fn test_numeric_ordering() {
        assert_eq!(cmp("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(cmp("1.0.0", "1.0.1"), Ordering::Less);
        assert_eq!(cmp("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(cmp("2.0", "1.5"), Ordering::Greater);
        assert_eq!(cmp("1.0", "1.0.0"), Ordering::Less);
    }

    #[test]
    fn test_qualifiers_sort_below_release() {
        assert_eq!(cmp("1.0.0 Alpha 1", "1.0.0"), Ordering::Less);
        assert_eq!(cmp("1.0.0 Beta 2", "1.0.0 RC 1"), Ordering::Less);
        assert_eq!(cmp("1.0.0 RC 1", "1.0.0"), Ordering::Less);
        assert_eq!(cmp("1.0.0 dev 3", "1.0.0 alpha 1"), Ordering::Less);
        assert_eq!(cmp("1.0.0 pl 1", "1.0.0"), Ordering::Greater);
        assert_eq!(cmp("1.0.0 pl 1", "1.0.1"), Ordering::Less);
        assert_eq!(cmp("1.0.0a1", "1.0.0 Alpha 1"), Ordering::Equal);
    }

    #[test]
    fn test_total_order_properties() {
        let versions = [
            "1.0.0 dev 1",
            "1.0.0 Alpha 1",
            "1.0.0 Beta 1",
            "1.0.0 RC 2",
            "1.0",
            "1.0.0",
            "1.0.0 pl 1",
            "1.0.1",
            "1.2",
            "2.0.0",
        ];

        for a in versions {
            assert_eq!(cmp(a, a), Ordering::Equal, "{} is not reflexive", a);
            for b in versions {
                assert_eq!(cmp(a, b), cmp(b, a).reverse(), "{} vs {}", a, b);
                for c in versions {
                    if cmp(a, b) == Ordering::Less && cmp(b, c) == Ordering::Less {
                        assert_eq!(cmp(a, c), Ordering::Less, "{} < {} < {}", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_segments() {
        assert!(matches!(
            compare("1.0.x", "1.0.0"),
            Err(Error::InvalidVersionFormat(_))
        ));
        assert!(matches!(
            compare("1..0", "1.0.0"),
            Err(Error::InvalidVersionFormat(_))
        ));
        assert!(matches!(compare("", "1.0.0"), Err(Error::InvalidVersionFormat(_))));
    }

    #[test]
    fn test_package_name_grammar() {
        assert!(is_valid_package_name("com.example.plugin"));
        assert!(is_valid_package_name("com.example_1.my-plugin"));
        assert!(!is_valid_package_name("com.example"));
        assert!(!is_valid_package_name("com..example"));
        assert!(!is_valid_package_name("com.example.plug in"));
    }

    #[test]
    fn test_manifest_version_grammar() {
        assert!(is_valid_version("1.2.0"));
        assert!(is_valid_version("2.0.0 Beta 3"));
        assert!(is_valid_version("2.0.0 rc 1"));
        assert!(!is_valid_version("1.2"));
        assert!(!is_valid_version("1.2.0-beta"));
    }

    #[test]
    fn test_abbreviation() {
        assert_eq!(abbreviation("com.example.blog"), "blog");
    }

    #[test]
    fn test_range_exact_and_wildcard() {
        assert!(satisfies_range("1.0.0", "1.0.0").unwrap());
        assert!(!satisfies_range("1.0.1", "1.0.0").unwrap());
        assert!(satisfies_range("1.0.7", "1.0.*").unwrap());
        assert!(satisfies_range("1.0.0 Beta 1", "1.0.0 beta *").unwrap());
        assert!(!satisfies_range("1.1.0", "1.0.*").unwrap());
    }

    #[test]
    fn test_range_clauses() {
        let range = ">=1.0.0, <2.0.0";
        assert!(satisfies_range("1.0.0", range).unwrap());
        assert!(satisfies_range("1.9.9", range).unwrap());
        assert!(!satisfies_range("2.0.0", range).unwrap());
        assert!(!satisfies_range("0.9.0", range).unwrap());
        assert!(satisfies_range("1.5.0", "> 1.0.0").unwrap());
        assert!(satisfies_range("1.0.0", "<= 1.0.0").unwrap());
    }

    #[test]
    fn test_range_rejects_garbage() {
        assert!(VersionRange::parse("").is_err());
        assert!(VersionRange::parse(">= banana").is_err());
    }
}
