//! Version string analysis
//!
//! Package versions in the wild are a mix of semantic versions, dates and
//! free-form strings. These helpers classify them, coerce loose versions into
//! semantic versions and evaluate node-style semantic version ranges with
//! pre-releases taking part in ordering.

use regex::Regex;
use semver::{BuildMetadata, Prerelease, Version};
use std::fmt;
use std::sync::OnceLock;

/// Ranges that accept every version and therefore skip filtering
const MATCH_ALL_RANGES: [&str; 8] = ["", "*", "any", "latest", "^*", "~*", "x", "X"];

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("version pattern is valid"))
}

fn strict_semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)(-[-A-Za-z0-9_+.]+)?$",
    )
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^([0-9]{4}-[0-9]{2}-[0-9]{2}|[0-9]{2}-[0-9]{2}-[0-9]{4})(-[-A-Za-z0-9_+.]+)?$",
    )
}

fn loose_semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^(?:.*@)?[vV]?0*([0-9]+)(?:\.0*([0-9]+)(?:\.0*([0-9]+))?)?(-[-A-Za-z0-9_+.]+)?$",
    )
}

fn range_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^(<=|>=|<|>|=|~>?|\^)?[vV]?([0-9]+|[xX*])(\.([0-9]+|[xX*]))?(\.([0-9]+|[xX*]))?(-[-A-Za-z0-9_+.]+)?(\+[-A-Za-z0-9.]+)?$",
    )
}

/// Strict `MAJOR.MINOR.PATCH(-PRE)?`
pub fn is_semver(version: &str) -> bool {
    strict_semver_re().is_match(version)
}

/// `YYYY-MM-DD` or `MM-DD-YYYY`, optionally followed by `-tag`
pub fn is_date(version: &str) -> bool {
    date_re().is_match(version)
}

/// Coerce a loose version (`v1.2`, `foo@01.2.3-rc1`) into a semantic version.
///
/// Dates are never coerced, even though `2023-01-02` would otherwise read as
/// major `2023` with a pre-release tag.
pub fn coerce_semver(version: &str) -> Option<String> {
    if is_date(version) {
        return None;
    }
    if is_semver(version) {
        return Some(version.to_string());
    }
    let caps = loose_semver_re().captures(version)?;
    let part = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("0");
    let pre = caps.get(4).map(|m| m.as_str()).unwrap_or("");
    Some(format!("{}.{}.{}{}", part(1), part(2), part(3), pre))
}

/// Whether `version` reads as a range rather than a single version
pub fn is_semver_range(version: &str) -> bool {
    let trimmed = version.trim();
    if matches!(trimmed, "*" | "any" | "latest" | "x" | "X") {
        return true;
    }
    if trimmed.is_empty() {
        return false;
    }
    trimmed.split("||").all(|alternative| {
        let alternative = alternative.trim();
        if let Some((low, high)) = alternative.split_once(" - ") {
            return range_token_re().is_match(low.trim())
                && range_token_re().is_match(high.trim());
        }
        merge_operator_tokens(alternative)
            .iter()
            .all(|token| range_token_re().is_match(token))
    })
}

/// Whether `range` accepts every version
pub fn is_match_all_range(range: &str) -> bool {
    MATCH_ALL_RANGES.contains(&range.trim())
}

/// A range that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid semantic version range '{range}': {reason}")]
pub struct InvalidRange {
    pub range: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    fn matches(&self, version: &Version) -> bool {
        match self.op {
            Op::Eq => version == &self.version,
            Op::Gt => version > &self.version,
            Op::Ge => version >= &self.version,
            Op::Lt => version < &self.version,
            Op::Le => version <= &self.version,
        }
    }
}

/// A version with possibly wildcarded trailing components
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

impl Partial {
    fn parse(text: &str, range: &str) -> Result<Self, InvalidRange> {
        let invalid = |reason: String| InvalidRange {
            range: range.to_string(),
            reason,
        };

        let text = text.trim_start_matches(['v', 'V', '=']);
        let text = text.split_once('+').map(|(v, _)| v).unwrap_or(text);
        let (numbers, pre) = match text.split_once('-') {
            Some((numbers, pre)) => (numbers, Some(pre)),
            None => (text, None),
        };

        let mut components = numbers.split('.');
        let mut next = || -> Result<Option<u64>, InvalidRange> {
            match components.next() {
                None | Some("x") | Some("X") | Some("*") => Ok(None),
                // Ceilings add one to a component
                Some(n) => match n.parse::<u64>() {
                    Ok(value) if value < u64::MAX => Ok(Some(value)),
                    Ok(_) => Err(invalid(format!("'{}' is too large", n))),
                    Err(_) => Err(invalid(format!("'{}' is not a version component", n))),
                },
            }
        };
        let major = next()?;
        let minor = if major.is_some() { next()? } else { None };
        let patch = if minor.is_some() { next()? } else { None };
        if components.next().is_some() {
            return Err(invalid(format!("'{}' has too many components", text)));
        }

        let pre = match pre {
            Some(tag) if patch.is_some() => Prerelease::new(tag)
                .map_err(|e| invalid(format!("bad pre-release '{}': {}", tag, e)))?,
            Some(tag) => {
                return Err(invalid(format!(
                    "pre-release '{}' requires a full version",
                    tag
                )))
            }
            None => Prerelease::EMPTY,
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    fn full(&self) -> Option<Version> {
        Some(Version {
            major: self.major?,
            minor: self.minor?,
            patch: self.patch?,
            pre: self.pre.clone(),
            build: BuildMetadata::EMPTY,
        })
    }

    /// Missing components filled with zero
    fn floor(&self) -> Option<Version> {
        Some(Version::new(
            self.major?,
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        ))
    }

    /// Smallest version above everything the wildcarded part covers
    fn ceiling(&self) -> Option<Version> {
        match (self.major, self.minor, self.patch) {
            (Some(major), None, _) => Some(lowest(major + 1, 0, 0)),
            (Some(major), Some(minor), None) => Some(lowest(major, minor + 1, 0)),
            _ => None,
        }
    }
}

/// `M.m.p-0`, the lowest version with that release triple
fn lowest(major: u64, minor: u64, patch: u64) -> Version {
    Version {
        major,
        minor,
        patch,
        pre: Prerelease::new("0").unwrap_or_default(),
        build: BuildMetadata::EMPTY,
    }
}

fn never() -> Vec<Comparator> {
    vec![Comparator::new(Op::Lt, lowest(0, 0, 0))]
}

/// A node-style semantic version range: `||` separated alternatives, each an
/// intersection of space separated comparators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemverRange {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl SemverRange {
    /// Parse a range
    pub fn parse(range: &str) -> Result<Self, InvalidRange> {
        let mut alternatives = Vec::new();
        for alternative in range.split("||") {
            alternatives.push(Self::parse_alternative(alternative.trim(), range)?);
        }
        Ok(Self {
            raw: range.to_string(),
            alternatives,
        })
    }

    fn parse_alternative(text: &str, range: &str) -> Result<Vec<Comparator>, InvalidRange> {
        if is_match_all_range(text) {
            return Ok(Vec::new());
        }

        if let Some((low, high)) = text.split_once(" - ") {
            let low = Partial::parse(low.trim(), range)?;
            let high = Partial::parse(high.trim(), range)?;
            let mut comparators = Vec::new();
            if let Some(floor) = low.floor() {
                comparators.push(Comparator::new(Op::Ge, floor));
            }
            if let Some(full) = high.full() {
                comparators.push(Comparator::new(Op::Le, full));
            } else if let Some(ceiling) = high.ceiling() {
                comparators.push(Comparator::new(Op::Lt, ceiling));
            }
            return Ok(comparators);
        }

        let mut comparators = Vec::new();
        for token in merge_operator_tokens(text) {
            if !range_token_re().is_match(&token) {
                return Err(InvalidRange {
                    range: range.to_string(),
                    reason: format!("'{}' is not a version comparator", token),
                });
            }
            let split = token
                .find(|c: char| c.is_ascii_alphanumeric() || c == '*')
                .unwrap_or(token.len());
            let (op, version) = token.split_at(split);
            let partial = Partial::parse(version, range)?;
            comparators.extend(Self::desugar(op, &partial));
        }
        Ok(comparators)
    }

    /// Lower one operator + partial version into primitive comparators
    fn desugar(op: &str, partial: &Partial) -> Vec<Comparator> {
        let Some(major) = partial.major else {
            // `*` style wildcards
            return match op {
                ">" | "<" => never(),
                _ => Vec::new(),
            };
        };
        let full = partial.full();
        let floor = partial.floor().unwrap_or_else(|| Version::new(major, 0, 0));

        match op {
            "" | "=" => match (full, partial.ceiling()) {
                (Some(version), _) => vec![Comparator::new(Op::Eq, version)],
                (None, Some(ceiling)) => vec![
                    Comparator::new(Op::Ge, floor),
                    Comparator::new(Op::Lt, ceiling),
                ],
                (None, None) => Vec::new(),
            },
            "~" | "~>" => {
                let ceiling = match partial.minor {
                    Some(minor) => lowest(major, minor + 1, 0),
                    None => lowest(major + 1, 0, 0),
                };
                vec![
                    Comparator::new(Op::Ge, full.unwrap_or(floor)),
                    Comparator::new(Op::Lt, ceiling),
                ]
            }
            "^" => {
                let minor = partial.minor;
                let ceiling = match (major, minor, partial.patch) {
                    (0, None, _) => lowest(1, 0, 0),
                    (0, Some(0), Some(patch)) => lowest(0, 0, patch + 1),
                    (0, Some(minor), _) => lowest(0, minor + 1, 0),
                    (major, _, _) => lowest(major + 1, 0, 0),
                };
                vec![
                    Comparator::new(Op::Ge, full.unwrap_or(floor)),
                    Comparator::new(Op::Lt, ceiling),
                ]
            }
            ">" => match full {
                Some(version) => vec![Comparator::new(Op::Gt, version)],
                None => match partial.minor {
                    Some(minor) => vec![Comparator::new(Op::Ge, Version::new(major, minor + 1, 0))],
                    None => vec![Comparator::new(Op::Ge, Version::new(major + 1, 0, 0))],
                },
            },
            ">=" => vec![Comparator::new(Op::Ge, full.unwrap_or(floor))],
            "<" => match full {
                Some(version) => vec![Comparator::new(Op::Lt, version)],
                None => vec![Comparator::new(
                    Op::Lt,
                    lowest(major, partial.minor.unwrap_or(0), 0),
                )],
            },
            "<=" => match (full, partial.ceiling()) {
                (Some(version), _) => vec![Comparator::new(Op::Le, version)],
                (None, Some(ceiling)) => vec![Comparator::new(Op::Lt, ceiling)],
                (None, None) => Vec::new(),
            },
            _ => never(),
        }
    }

    /// Whether `version` lies in the range
    pub fn matches(&self, version: &Version) -> bool {
        let version = Version {
            build: BuildMetadata::EMPTY,
            ..version.clone()
        };
        self.alternatives
            .iter()
            .any(|alternative| alternative.iter().all(|c| c.matches(&version)))
    }

    /// Coerce `version` loosely and test it; uncoercible versions never match
    pub fn matches_str(&self, version: &str) -> bool {
        coerce_semver(version)
            .and_then(|v| Version::parse(&v).ok())
            .is_some_and(|v| self.matches(&v))
    }

    /// The range as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SemverRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split on whitespace, gluing a bare operator to the version after it
fn merge_operator_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut pending: Option<&str> = None;
    for token in text.split_whitespace() {
        if matches!(token, "<" | "<=" | ">" | ">=" | "=" | "~" | "^" | "~>") {
            pending = Some(token);
            continue;
        }
        match pending.take() {
            Some(op) => tokens.push(format!("{}{}", op, token)),
            None => tokens.push(token.to_string()),
        }
    }
    if let Some(op) = pending {
        tokens.push(op.to_string());
    }
    tokens
}
