//! Version validation and ordering.
//!
//! Two schemes are supported:
//! - [`VersionScheme::Semver`]: strict semantic versioning (`1.2.3`,
//!   `1.2.3-rc.1+build.5`). Build metadata does not take part in ordering.
//! - [`VersionScheme::Dotted`]: one or more dot separated numbers with an
//!   optional trailing qualifier (`1.4`, `2.0.1.7`, `1.0b2`, `3.1-beta.2`).
//!   Missing trailing components count as zero and a qualified version
//!   orders before the same unqualified version.
//!
//! Strings that fail validation under the active scheme are never ordered:
//! [`VersionScheme::compare`] returns `None` for them.

use std::cmp::Ordering;

use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionScheme {
    #[default]
    Semver,
    Dotted,
}

impl VersionScheme {
    #[must_use]
    pub fn validate(self, version: &str) -> bool {
        match self {
            Self::Semver => Version::parse(version).is_ok(),
            Self::Dotted => DottedVersion::parse(version).is_some(),
        }
    }

    /// Order two versions, or `None` if either fails validation.
    #[must_use]
    pub fn compare(self, a: &str, b: &str) -> Option<Ordering> {
        match self {
            Self::Semver => {
                let a = Version::parse(a).ok()?;
                let b = Version::parse(b).ok()?;
                Some(semver_precedence(&a, &b))
            }
            Self::Dotted => {
                let a = DottedVersion::parse(a)?;
                let b = DottedVersion::parse(b)?;
                Some(a.cmp(&b))
            }
        }
    }

    /// True when `candidate` is valid and strictly newer than `current`.
    ///
    /// A missing or invalid `current` never blocks a valid candidate.
    #[must_use]
    pub fn is_newer(self, candidate: &str, current: Option<&str>) -> bool {
        if !self.validate(candidate) {
            return false;
        }
        match current {
            Some(current) if self.validate(current) => {
                self.compare(candidate, current) == Some(Ordering::Greater)
            }
            _ => true,
        }
    }
}

fn semver_precedence(a: &Version, b: &Version) -> Ordering {
    a.major
        .cmp(&b.major)
        .then(a.minor.cmp(&b.minor))
        .then(a.patch.cmp(&b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

#[derive(Debug, Clone)]
struct DottedVersion {
    numbers: Vec<u64>,
    qualifier: Option<Vec<QualifierPart>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum QualifierPart {
    Numeric(u64),
    Text(String),
}

impl DottedVersion {
    fn parse(input: &str) -> Option<Self> {
        let core_end = input
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(input.len());
        let (core, rest) = input.split_at(core_end);

        let mut numbers = Vec::new();
        for part in core.split('.') {
            if part.is_empty() {
                // A trailing dot before a qualifier ("1.0.beta") is tolerated,
                // any other empty component is not.
                if rest.is_empty() || !core.ends_with('.') || numbers.is_empty() {
                    return None;
                }
                continue;
            }
            numbers.push(part.parse::<u64>().ok()?);
        }
        if numbers.is_empty() {
            return None;
        }

        let qualifier = if rest.is_empty() {
            None
        } else {
            Some(parse_qualifier(rest)?)
        };

        Some(Self { numbers, qualifier })
    }
}

fn parse_qualifier(rest: &str) -> Option<Vec<QualifierPart>> {
    let body = rest.strip_prefix(['-', '+', '_', '~']).unwrap_or(rest);
    if body.is_empty()
        || !body
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
    {
        return None;
    }

    let mut parts = Vec::new();
    for segment in body.split(['.', '-', '_']).filter(|s| !s.is_empty()) {
        let mut current = String::new();
        let mut numeric = false;
        for ch in segment.chars() {
            let is_digit = ch.is_ascii_digit();
            if !current.is_empty() && is_digit != numeric {
                parts.push(qualifier_part(&current, numeric)?);
                current.clear();
            }
            numeric = is_digit;
            current.push(ch);
        }
        if !current.is_empty() {
            parts.push(qualifier_part(&current, numeric)?);
        }
    }

    if parts.is_empty() { None } else { Some(parts) }
}

fn qualifier_part(text: &str, numeric: bool) -> Option<QualifierPart> {
    if numeric {
        text.parse::<u64>().ok().map(QualifierPart::Numeric)
    } else {
        Some(QualifierPart::Text(text.to_ascii_lowercase()))
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.numbers.len().max(other.numbers.len());
        for index in 0..len {
            let a = self.numbers.get(index).copied().unwrap_or(0);
            let b = other.numbers.get(index).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ordering => return ordering,
            }
        }

        match (&self.qualifier, &other.qualifier) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialEq for DottedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DottedVersion {}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
