//! Self-contained semver parser, comparator, and npm-style range resolver.
//!
//! The teacher (`rnp`) leans on the `semver` crate and layers a hand-written
//! clause normalizer (`NpmVersionReq`) on top of it to cope with npm's looser
//! range grammar. `VersionReq` can't express a disjunction of comparator sets,
//! hyphen ranges with a partial upper bound, or "return nil rather than raise"
//! parse failures, so this module generalizes the teacher's normalization
//! technique into a full implementation instead of wrapping the crate.

use std::cmp::Ordering;
use std::fmt;

/// A parsed identifier within a prerelease tag: either numeric or alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identifier {
    Numeric(u64),
    AlphaNumeric(String),
}

impl Identifier {
    fn parse(s: &str) -> Self {
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = s.parse::<u64>() {
                return Identifier::Numeric(n);
            }
        }
        Identifier::AlphaNumeric(s.to_string())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{n}"),
            Identifier::AlphaNumeric(s) => write!(f, "{s}"),
        }
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::AlphaNumeric(a), Identifier::AlphaNumeric(b)) => a.cmp(b),
            // numeric identifiers always have lower precedence than alphanumeric ones
            (Identifier::Numeric(_), Identifier::AlphaNumeric(_)) => Ordering::Less,
            (Identifier::AlphaNumeric(_), Identifier::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    prerelease: Vec<Identifier>,
    prerelease_raw: String,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: Vec::new(),
            prerelease_raw: String::new(),
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }

    /// Parses a version string. Accepts an optional leading `v` or `=`.
    /// Returns `None` (nil) rather than an error on malformed input, per spec.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        let s = s.strip_prefix('=').unwrap_or(s);
        let s = s.strip_prefix('v').unwrap_or(s);

        // split off build metadata first (ignored for precedence)
        let s = s.split('+').next().unwrap_or(s);

        let (core, prerelease_raw) = match s.split_once('-') {
            Some((core, pre)) => (core, pre.to_string()),
            None => (s, String::new()),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse::<u64>().ok()?;
        let minor = parts.next()?.parse::<u64>().ok()?;
        let patch = parts.next()?.parse::<u64>().ok()?;
        if parts.next().is_some() {
            return None;
        }

        let prerelease = if prerelease_raw.is_empty() {
            Vec::new()
        } else {
            prerelease_raw
                .split('.')
                .map(Identifier::parse)
                .collect::<Vec<_>>()
        };

        Some(Self {
            major,
            minor,
            patch,
            prerelease,
            prerelease_raw,
        })
    }

    pub fn compare(a: &Version, b: &Version) -> Ordering {
        a.major
            .cmp(&b.major)
            .then(a.minor.cmp(&b.minor))
            .then(a.patch.cmp(&b.patch))
            .then_with(|| match (a.prerelease.is_empty(), b.prerelease.is_empty()) {
                (true, true) => Ordering::Equal,
                // a version without prerelease outranks one with, for equal core triples
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    for (x, y) in a.prerelease.iter().zip(b.prerelease.iter()) {
                        let ord = x.cmp(y);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    a.prerelease.len().cmp(&b.prerelease.len())
                }
            })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        Version::compare(self, other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease_raw.is_empty() {
            write!(f, "-{}", self.prerelease_raw)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn test(&self, v: &Version) -> bool {
        let ord = Version::compare(v, &self.version);
        match self.op {
            Op::Gte => ord != Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Lt => ord == Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
        }
    }

    /// Whether this comparator's boundary version carries a prerelease tag; used to
    /// decide whether a range "explicitly mentions" a prerelease (spec.md §3).
    fn mentions_prerelease(&self) -> bool {
        self.version.is_prerelease()
    }
}

/// One conjunction of comparators (an AND-clause); a [`Range`] is a disjunction of these.
#[derive(Debug, Clone)]
struct Conjunction {
    comparators: Vec<Comparator>,
}

impl Conjunction {
    fn test(&self, v: &Version) -> bool {
        self.comparators.iter().all(|c| c.test(v))
    }

    fn mentions_prerelease(&self) -> bool {
        self.comparators.iter().any(|c| c.mentions_prerelease())
    }
}

#[derive(Debug, Clone)]
pub struct Range {
    raw: String,
    disjuncts: Vec<Conjunction>,
}

fn any_range(raw: &str) -> Range {
    Range {
        raw: raw.to_string(),
        disjuncts: vec![Conjunction {
            comparators: vec![Comparator {
                op: Op::Gte,
                version: Version::new(0, 0, 0),
            }],
        }],
    }
}

/// Expands `X`, `X.Y`, `x`/`*`/missing components into `[min, exclusive-next)`.
fn partial_bounds(major: &str, minor: Option<&str>, patch: Option<&str>) -> Option<(Version, Option<Version>)> {
    let is_wild = |s: &str| matches!(s, "x" | "X" | "*");
    if is_wild(major) {
        return Some((Version::new(0, 0, 0), None));
    }
    let maj: u64 = major.parse().ok()?;

    match minor {
        None => Some((Version::new(maj, 0, 0), Some(Version::new(maj + 1, 0, 0)))),
        Some(m) if is_wild(m) => {
            Some((Version::new(maj, 0, 0), Some(Version::new(maj + 1, 0, 0))))
        }
        Some(m) => {
            let min: u64 = m.parse().ok()?;
            match patch {
                None => Some((
                    Version::new(maj, min, 0),
                    Some(Version::new(maj, min + 1, 0)),
                )),
                Some(p) if is_wild(p) => Some((
                    Version::new(maj, min, 0),
                    Some(Version::new(maj, min + 1, 0)),
                )),
                Some(p) => {
                    let pat: u64 = p.parse().ok()?;
                    Some((Version::new(maj, min, pat), None))
                }
            }
        }
    }
}

fn split_triple(v: &str) -> (String, Option<String>, Option<String>) {
    let mut parts = v.trim().splitn(3, '.');
    let major = parts.next().unwrap_or("0").to_string();
    let minor = parts.next().map(|s| s.to_string());
    let patch = parts.next().map(|s| s.to_string());
    (major, minor, patch)
}

fn expand_caret(v: &str) -> Option<Conjunction> {
    let version = Version::parse(v)?;
    let upper = if version.major > 0 {
        Version::new(version.major + 1, 0, 0)
    } else if version.minor > 0 {
        Version::new(0, version.minor + 1, 0)
    } else {
        Version::new(0, 0, version.patch + 1)
    };
    Some(Conjunction {
        comparators: vec![
            Comparator {
                op: Op::Gte,
                version: version.clone(),
            },
            Comparator {
                op: Op::Lt,
                version: upper,
            },
        ],
    })
}

fn expand_tilde(v: &str) -> Option<Conjunction> {
    let version = Version::parse(v)?;
    let upper = Version::new(version.major, version.minor + 1, 0);
    Some(Conjunction {
        comparators: vec![
            Comparator {
                op: Op::Gte,
                version: version.clone(),
            },
            Comparator {
                op: Op::Lt,
                version: upper,
            },
        ],
    })
}

fn expand_hyphen(lo: &str, hi: &str) -> Option<Conjunction> {
    let (lo_maj, lo_min, lo_pat) = split_triple(lo);
    let (lo_bound, _) = partial_bounds(&lo_maj, lo_min.as_deref(), lo_pat.as_deref())?;

    let (hi_maj, hi_min, hi_pat) = split_triple(hi);
    let (hi_lo, hi_exclusive_next) = partial_bounds(&hi_maj, hi_min.as_deref(), hi_pat.as_deref())?;

    // A fully-specified upper bound (X.Y.Z) is inclusive; a partial one relaxes
    // to the exclusive next version, per spec.md §3.
    let upper_comparator = match hi_exclusive_next {
        Some(next) => Comparator {
            op: Op::Lt,
            version: next,
        },
        None => Comparator {
            op: Op::Lte,
            version: hi_lo,
        },
    };

    Some(Conjunction {
        comparators: vec![
            Comparator {
                op: Op::Gte,
                version: lo_bound,
            },
            upper_comparator,
        ],
    })
}

fn expand_plain_partial_or_exact(clause: &str) -> Option<Conjunction> {
    if clause.contains('x') || clause.contains('X') || clause.contains('*') {
        let (maj, min, pat) = split_triple(clause);
        let (lo, hi) = partial_bounds(&maj, min.as_deref(), pat.as_deref())?;
        let mut comparators = vec![Comparator {
            op: Op::Gte,
            version: lo,
        }];
        if let Some(hi) = hi {
            comparators.push(Comparator { op: Op::Lt, version: hi });
        }
        return Some(Conjunction { comparators });
    }

    // bare partials "1" or "1.2" expand the same way as x-ranges
    let dot_count = clause.matches('.').count();
    if dot_count < 2 && clause.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        let (maj, min, pat) = split_triple(clause);
        let (lo, hi) = partial_bounds(&maj, min.as_deref(), pat.as_deref())?;
        let mut comparators = vec![Comparator {
            op: Op::Gte,
            version: lo,
        }];
        if let Some(hi) = hi {
            comparators.push(Comparator { op: Op::Lt, version: hi });
        }
        return Some(Conjunction { comparators });
    }

    None
}

fn parse_single_comparator(token: &str) -> Option<Comparator> {
    let (op, rest) = if let Some(r) = token.strip_prefix(">=") {
        (Op::Gte, r)
    } else if let Some(r) = token.strip_prefix("<=") {
        (Op::Lte, r)
    } else if let Some(r) = token.strip_prefix('>') {
        (Op::Gt, r)
    } else if let Some(r) = token.strip_prefix('<') {
        (Op::Lt, r)
    } else if let Some(r) = token.strip_prefix('=') {
        (Op::Eq, r)
    } else {
        (Op::Eq, token)
    };
    let version = Version::parse(rest.trim())?;
    Some(Comparator { op, version })
}

fn parse_conjunction(clause: &str) -> Option<Conjunction> {
    let clause = clause.trim();
    if clause.is_empty() || clause == "*" || clause.eq_ignore_ascii_case("x") || clause == "latest" {
        return Some(Conjunction {
            comparators: vec![Comparator {
                op: Op::Gte,
                version: Version::new(0, 0, 0),
            }],
        });
    }

    if let Some((lo, hi)) = clause.split_once(" - ") {
        return expand_hyphen(lo.trim(), hi.trim());
    }

    if let Some(rest) = clause.strip_prefix('^') {
        return expand_caret(rest.trim());
    }

    if let Some(rest) = clause.strip_prefix('~') {
        return expand_tilde(rest.trim());
    }

    if let Some(conj) = expand_plain_partial_or_exact(clause) {
        return Some(conj);
    }

    // space-separated comparator list, e.g. ">=1.2.3 <2.0.0"
    let mut comparators = Vec::new();
    for token in clause.split_whitespace() {
        comparators.push(parse_single_comparator(token)?);
    }
    if comparators.is_empty() {
        None
    } else {
        Some(Conjunction { comparators })
    }
}

impl Range {
    /// Parses an npm-style range string. Falls back to `>=0.0.0` (permissive) on
    /// any parse failure, per spec.md §4.A, rather than failing the caller.
    pub fn parse(input: &str) -> Range {
        let raw = input.trim();
        if raw.is_empty() || raw == "*" || raw.eq_ignore_ascii_case("x") || raw == "latest" {
            return any_range(raw);
        }

        let mut disjuncts = Vec::new();
        for clause in raw.split("||") {
            match parse_conjunction(clause.trim()) {
                Some(conj) => disjuncts.push(conj),
                None => return any_range(raw),
            }
        }

        if disjuncts.is_empty() {
            return any_range(raw);
        }

        Range {
            raw: raw.to_string(),
            disjuncts,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn explicitly_mentions_prerelease(&self) -> bool {
        self.disjuncts.iter().any(|d| d.mentions_prerelease())
    }

    pub fn satisfies(&self, version: &Version) -> bool {
        if version.is_prerelease() && !self.explicitly_mentions_prerelease() {
            return false;
        }
        self.disjuncts.iter().any(|d| d.test(version))
    }

    /// Picks the highest-precedence non-prerelease version a range admits.
    /// Prereleases are filtered out before comparing, per spec.md §4.A, unless
    /// the range explicitly mentions one.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        versions
            .into_iter()
            .filter(|v| self.satisfies(v))
            .max_by(|a, b| Version::compare(a, b))
            .cloned()
    }
}

impl fmt::Display for Range {
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
    fn parses_with_leading_v_or_eq() {
        assert_eq!(Version::parse("v1.2.3"), Version::parse("1.2.3"));
        assert_eq!(Version::parse("=1.2.3"), Version::parse("1.2.3"));
    }

    #[test]
    fn invalid_version_is_nil() {
        assert!(Version::parse("not-a-version").is_none());
        assert!(Version::parse("1.2").is_none());
    }

    #[test]
    fn prerelease_ordering() {
        assert!(v("1.0.0-alpha") < v("1.0.0-alpha.1"));
        assert!(v("1.0.0-alpha.1") < v("1.0.0-alpha.beta"));
        assert!(v("1.0.0-beta") < v("1.0.0-beta.2"));
        assert!(v("1.0.0-beta.11") < v("1.0.0-rc.1"));
        assert!(v("1.0.0-rc.1") < v("1.0.0"));
        assert!(v("1.0.0-alpha.1") < v("1.0.0-alpha.10"));
    }

    #[test]
    fn any_range_satisfies_everything() {
        for r in ["", "*", "latest", "x"] {
            let range = Range::parse(r);
            assert!(range.satisfies(&v("0.0.1")));
            assert!(range.satisfies(&v("9.9.9")));
        }
    }

    #[test]
    fn caret_range() {
        let r = Range::parse("^1.2.3");
        assert!(r.satisfies(&v("1.2.3")));
        assert!(r.satisfies(&v("1.9.9")));
        assert!(!r.satisfies(&v("2.0.0")));
        assert!(!r.satisfies(&v("1.2.2")));
    }

    #[test]
    fn caret_zero_major() {
        let r = Range::parse("^0.2.3");
        assert!(r.satisfies(&v("0.2.9")));
        assert!(!r.satisfies(&v("0.3.0")));
    }

    #[test]
    fn tilde_range() {
        let r = Range::parse("~1.2.3");
        assert!(r.satisfies(&v("1.2.9")));
        assert!(!r.satisfies(&v("1.3.0")));
    }

    #[test]
    fn hyphen_range() {
        let r = Range::parse("1.2.3 - 2.3.4");
        assert!(r.satisfies(&v("1.2.3")));
        assert!(r.satisfies(&v("2.3.4")));
        assert!(!r.satisfies(&v("2.3.5")));
    }

    #[test]
    fn hyphen_range_partial_upper_relaxes() {
        let r = Range::parse("1.2.3 - 2.3");
        assert!(r.satisfies(&v("2.3.9")));
        assert!(!r.satisfies(&v("2.4.0")));
    }

    #[test]
    fn x_range() {
        let r = Range::parse("1.2.x");
        assert!(r.satisfies(&v("1.2.0")));
        assert!(r.satisfies(&v("1.2.9")));
        assert!(!r.satisfies(&v("1.3.0")));
    }

    #[test]
    fn prereleases_excluded_unless_mentioned() {
        let r = Range::parse("^2.0.0");
        assert!(!r.satisfies(&v("2.0.0-rc.1")));

        let r2 = Range::parse(">=2.0.0-rc.0");
        assert!(r2.satisfies(&v("2.0.0-rc.1")));
    }

    #[test]
    fn max_satisfying_excludes_prereleases() {
        let versions = ["1.0.0", "1.2.3", "2.0.0-rc.1", "2.0.0"].map(|s| v(s));
        let r = Range::parse("^1.0.0");
        assert_eq!(r.max_satisfying(versions.iter()).unwrap(), v("1.2.3"));
    }

    #[test]
    fn spec_scenario_semver() {
        let versions = ["1.0.0", "1.2.3", "2.0.0-rc.1", "2.0.0"].map(|s| v(s));
        let r = Range::parse("^1.0.0");
        assert_eq!(r.max_satisfying(versions.iter()).unwrap(), v("1.2.3"));
        assert!(Range::parse("~1.2.0").satisfies(&v("1.2.3")));
        assert!(!Range::parse("^2.0.0").satisfies(&v("2.0.0-rc.1")));
    }

    #[test]
    fn unparseable_range_degrades_permissive() {
        let r = Range::parse("this is not a range at all!!!");
        assert!(r.satisfies(&v("0.0.1")));
    }
}
