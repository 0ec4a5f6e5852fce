//! Plugin versions, version ranges and API compatibility.
//!
//! Versions are parsed leniently: `1`, `1.2` and `1.2.3` are all accepted and
//! padded to three components, and pre-release or build suffixes are ignored
//! for ordering. A range is a whitespace-separated list of comparator clauses
//! (`>=1.0 <2`) that must all hold.

use semver::Version;
use std::cmp::Ordering;
use std::fmt;

/// API version of the host runtime. Plugins declare the version they target in
/// `apiVersion`; only the major component has to match.
pub const RUNTIME_API_VERSION: &str = "1";

/// Parse a version string leniently. Returns `None` for anything that is not
/// one to three dot-separated numbers.
pub fn parse_version(raw: &str) -> Option<Version> {
    let core = raw
        .trim()
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    if core.is_empty() {
        return None;
    }

    let mut parts = [0u64; 3];
    let mut count = 0;
    for piece in core.split('.') {
        if count == 3 || piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        parts[count] = piece.parse().ok()?;
        count += 1;
    }

    Some(Version::new(parts[0], parts[1], parts[2]))
}

/// Compare two version strings. Unparseable versions sort before parseable ones
/// and fall back to string comparison among themselves.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    match (parse_version(left), parse_version(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

/// Major component of an `apiVersion` value (`"1"`, `"1.4"`).
pub fn api_major(raw: &str) -> Option<u64> {
    raw.trim().split('.').next()?.parse().ok()
}

/// Whether a plugin targeting `plugin_api` can run on this runtime.
pub fn is_api_compatible(plugin_api: &str) -> bool {
    match (api_major(plugin_api), api_major(RUNTIME_API_VERSION)) {
        (Some(plugin), Some(runtime)) => plugin == runtime,
        _ => false,
    }
}

/// Comparison operator of a single range clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
        }
    }
}

/// A single `op version` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub op: Op,
    pub version: Version,
}

impl Clause {
    fn matches(&self, version: &Version) -> bool {
        let ord = version.cmp(&self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

/// A conjunction of comparator clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    clauses: Vec<Clause>,
}

impl VersionRange {
    /// Parse a range expression such as `>=1.2.0 <2.0.0` or `= 1.4`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut clauses = Vec::new();
        let mut pending_op: Option<Op> = None;

        for token in raw.split_whitespace() {
            let (op, rest) = split_operator(token);
            let op = match (pending_op.take(), op) {
                (Some(_), Some(_)) => return Err(format!("dangling operator in '{raw}'")),
                (Some(pending), None) => Some(pending),
                (None, op) => op,
            };

            if rest.is_empty() {
                if op.is_none() {
                    return Err(format!("empty clause in '{raw}'"));
                }
                pending_op = op;
                continue;
            }

            let version =
                parse_version(rest).ok_or_else(|| format!("invalid version '{rest}' in '{raw}'"))?;
            clauses.push(Clause {
                op: op.unwrap_or(Op::Eq),
                version,
            });
        }

        if pending_op.is_some() {
            return Err(format!("dangling operator in '{raw}'"));
        }
        if clauses.is_empty() {
            return Err("empty version range".to_string());
        }
        Ok(Self { clauses })
    }

    /// Whether `version` satisfies every clause. Unparseable versions never match.
    pub fn matches(&self, version: &str) -> bool {
        match parse_version(version) {
            Some(v) => self.clauses.iter().all(|c| c.matches(&v)),
            None => false,
        }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .clauses
            .iter()
            .map(|c| format!("{}{}", c.op.as_str(), c.version))
            .collect();
        f.write_str(&rendered.join(" "))
    }
}

/// Whether `version` satisfies the optional range expression. A missing or
/// blank range accepts anything; a malformed range accepts nothing.
pub fn satisfies(version: &str, range: Option<&str>) -> bool {
    match range.map(str::trim) {
        None | Some("") => true,
        Some(expr) => VersionRange::parse(expr)
            .map(|r| r.matches(version))
            .unwrap_or(false),
    }
}

fn split_operator(token: &str) -> (Option<Op>, &str) {
    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("==", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = token.strip_prefix(prefix) {
            return (Some(op), rest);
        }
    }
    (None, token)
}
