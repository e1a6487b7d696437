//! Pip requirement strings
//!
//! Parses the subset of PEP 508 / pip requirements-file syntax that model
//! manifests carry: named requirements with extras, version specifiers and
//! environment markers, direct references (URLs, VCS, local paths), nested
//! `-r` includes and `-c` constraint references.

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while parsing requirement strings
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequirementError {
    #[error("Empty requirement string")]
    Empty,

    #[error("Invalid requirement '{input}': {reason}")]
    Malformed { input: String, reason: String },

    #[error("Failed to read requirements file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Requirements file {0} includes itself")]
    IncludeCycle(String),
}

pub type Result<T> = std::result::Result<T, RequirementError>;

/// Version comparison operator of a specifier clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Arbitrary,
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    Compatible,
    Less,
    Greater,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "===" => Comparison::Arbitrary,
            "==" => Comparison::Equal,
            "!=" => Comparison::NotEqual,
            "<=" => Comparison::LessEqual,
            ">=" => Comparison::GreaterEqual,
            "~=" => Comparison::Compatible,
            "<" => Comparison::Less,
            ">" => Comparison::Greater,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Arbitrary => "===",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
            Comparison::LessEqual => "<=",
            Comparison::GreaterEqual => ">=",
            Comparison::Compatible => "~=",
            Comparison::Less => "<",
            Comparison::Greater => ">",
        }
    }
}

/// A single `op version` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionClause {
    pub op: Comparison,
    pub version: String,
}

/// A parsed pip requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `name[extras]<specifier>; marker`
    Named {
        name: String,
        extras: Vec<String>,
        clauses: Vec<VersionClause>,
        marker: Option<String>,
    },
    /// URL, VCS link, local archive or `name @ url`; kept verbatim
    Reference {
        name: Option<String>,
        raw: String,
    },
}

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?$").expect("static regex")
    })
}

fn clause_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(===|==|!=|<=|>=|~=|<|>)\s*([A-Za-z0-9][A-Za-z0-9._+*!-]*)$")
            .expect("static regex")
    })
}

fn separator_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-_.]+").expect("static regex"))
}

/// PEP 503 normalisation: lowercase, runs of `-`, `_`, `.` become `-`
pub fn canonicalize_name(name: &str) -> String {
    separator_pattern()
        .replace_all(&name.to_lowercase(), "-")
        .into_owned()
}

/// Drop a PEP 440 local version label (`1.13.0+cu117` -> `1.13.0`)
pub fn strip_local_version(version: &str) -> &str {
    version.split('+').next().unwrap_or(version)
}

const REFERENCE_PREFIXES: &[&str] = &[
    "git+", "hg+", "svn+", "bzr+", "http://", "https://", "file:", "./", "../", "/",
];
const ARCHIVE_SUFFIXES: &[&str] = &[".whl", ".tar.gz", ".zip", ".tar.bz2"];

fn malformed(input: &str, reason: impl Into<String>) -> RequirementError {
    RequirementError::Malformed {
        input: input.to_string(),
        reason: reason.into(),
    }
}

impl Requirement {
    /// Parse a single requirement string
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim();
        if text.is_empty() {
            return Err(RequirementError::Empty);
        }

        if REFERENCE_PREFIXES.iter().any(|p| text.starts_with(p)) {
            return Ok(Requirement::Reference {
                name: None,
                raw: text.to_string(),
            });
        }

        let (body, marker) = match text.split_once(';') {
            Some((body, marker)) => {
                let marker = marker.trim();
                if marker.is_empty() {
                    return Err(malformed(input, "empty environment marker"));
                }
                (body.trim(), Some(marker.to_string()))
            }
            None => (text, None),
        };

        // `name @ url` direct reference
        if let Some((name, url)) = body.split_once(" @ ").or_else(|| body.split_once('@')) {
            let name = name.trim();
            let url = url.trim();
            let bare_name = name.split('[').next().unwrap_or(name).trim();
            if !name_pattern().is_match(bare_name) {
                return Err(malformed(input, format!("invalid package name '{}'", bare_name)));
            }
            if url.is_empty() {
                return Err(malformed(input, "missing URL after '@'"));
            }
            return Ok(Requirement::Reference {
                name: Some(bare_name.to_string()),
                raw: text.to_string(),
            });
        }

        if ARCHIVE_SUFFIXES.iter().any(|s| body.ends_with(s)) {
            return Ok(Requirement::Reference {
                name: None,
                raw: text.to_string(),
            });
        }

        let name_end = body
            .find(|c: char| c == '[' || c.is_whitespace() || "=!<>~(".contains(c))
            .unwrap_or(body.len());
        let name = &body[..name_end];
        if !name_pattern().is_match(name) {
            return Err(malformed(input, format!("invalid package name '{}'", name)));
        }

        let mut rest = body[name_end..].trim_start();
        let mut extras = Vec::new();
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket
                .find(']')
                .ok_or_else(|| malformed(input, "unbalanced extras bracket"))?;
            for extra in after_bracket[..close].split(',') {
                let extra = extra.trim();
                if !name_pattern().is_match(extra) {
                    return Err(malformed(input, format!("invalid extra '{}'", extra)));
                }
                extras.push(extra.to_string());
            }
            rest = after_bracket[close + 1..].trim_start();
        }

        if let Some(inner) = rest.strip_prefix('(') {
            rest = inner
                .strip_suffix(')')
                .ok_or_else(|| malformed(input, "unbalanced specifier parentheses"))?
                .trim();
        }

        let mut clauses = Vec::new();
        if !rest.is_empty() {
            for clause in rest.split(',') {
                let clause = clause.trim();
                let caps = clause_pattern()
                    .captures(clause)
                    .ok_or_else(|| malformed(input, format!("invalid version specifier '{}'", clause)))?;
                let op = Comparison::parse(&caps[1])
                    .ok_or_else(|| malformed(input, format!("unknown operator '{}'", &caps[1])))?;
                clauses.push(VersionClause {
                    op,
                    version: caps[2].to_string(),
                });
            }
        }

        Ok(Requirement::Named {
            name: name.to_string(),
            extras,
            clauses,
            marker,
        })
    }

    /// Package name as written, if the requirement names one
    pub fn name(&self) -> Option<&str> {
        match self {
            Requirement::Named { name, .. } => Some(name),
            Requirement::Reference { name, .. } => name.as_deref(),
        }
    }

    /// PEP 503 canonical package name
    pub fn canonical_name(&self) -> Option<String> {
        self.name().map(canonicalize_name)
    }

    /// Exact version when the specifier is a single `==` clause
    pub fn pinned_version(&self) -> Option<&str> {
        match self {
            Requirement::Named { clauses, .. } => match clauses.as_slice() {
                [VersionClause {
                    op: Comparison::Equal,
                    version,
                }] if !version.contains('*') => Some(version),
                _ => None,
            },
            Requirement::Reference { .. } => None,
        }
    }

    /// Whether the requirement is fully determined: `==` pinned or a direct reference
    pub fn is_pinned(&self) -> bool {
        match self {
            Requirement::Named { .. } => self.pinned_version().is_some(),
            Requirement::Reference { .. } => true,
        }
    }

    /// Whether `version` satisfies every specifier clause
    ///
    /// Only release segments are compared; pre/post/dev tags are ignored
    /// except by `===`.
    pub fn satisfied_by(&self, version: &str) -> bool {
        match self {
            Requirement::Named { clauses, .. } => {
                clauses.iter().all(|clause| clause_matches(clause, version))
            }
            Requirement::Reference { .. } => true,
        }
    }

    /// Replace the specifier with `==version`, keeping extras and marker
    pub fn pin(&mut self, version: &str) {
        if let Requirement::Named { clauses, .. } = self {
            *clauses = vec![VersionClause {
                op: Comparison::Equal,
                version: strip_local_version(version).to_string(),
            }];
        }
    }
}

fn release_segments(version: &str) -> Vec<u64> {
    let version = strip_local_version(version);
    let version = version.split_once('!').map_or(version, |(_, v)| v);
    let mut segments = Vec::new();
    for part in version.split('.') {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse() {
            Ok(n) => segments.push(n),
            Err(_) => break,
        }
        // `0rc1` contributes its leading number and ends the release
        if digits.len() != part.len() {
            break;
        }
    }
    segments
}

fn compare_release(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

fn wildcard_matches(pattern: &str, version: &str) -> bool {
    let prefix = release_segments(pattern.trim_end_matches(".*"));
    let actual = release_segments(version);
    actual.len() >= prefix.len() && actual[..prefix.len()] == prefix[..]
}

fn clause_matches(clause: &VersionClause, version: &str) -> bool {
    use std::cmp::Ordering::*;

    if clause.op != Comparison::Arbitrary && clause.version.ends_with(".*") {
        let matched = wildcard_matches(&clause.version, version);
        return match clause.op {
            Comparison::Equal => matched,
            Comparison::NotEqual => !matched,
            _ => false,
        };
    }

    let ordering = compare_release(&release_segments(version), &release_segments(&clause.version));
    match clause.op {
        Comparison::Equal => ordering == Equal,
        Comparison::NotEqual => ordering != Equal,
        Comparison::LessEqual => ordering != Greater,
        Comparison::GreaterEqual => ordering != Less,
        Comparison::Less => ordering == Less,
        Comparison::Greater => ordering == Greater,
        Comparison::Compatible => {
            let target = release_segments(&clause.version);
            if target.len() < 2 || ordering == Less {
                return false;
            }
            let prefix = &target[..target.len() - 1];
            let actual = release_segments(version);
            actual.len() >= prefix.len() && actual[..prefix.len()] == *prefix
        }
        Comparison::Arbitrary => clause.version == version,
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Reference { raw, .. } => f.write_str(raw),
            Requirement::Named {
                name,
                extras,
                clauses,
                marker,
            } => {
                f.write_str(name)?;
                if !extras.is_empty() {
                    write!(f, "[{}]", extras.join(","))?;
                }
                let spec: Vec<String> = clauses
                    .iter()
                    .map(|c| format!("{}{}", c.op.as_str(), c.version))
                    .collect();
                f.write_str(&spec.join(","))?;
                if let Some(marker) = marker {
                    write!(f, "; {}", marker)?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Requirement {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self> {
        Requirement::parse(s)
    }
}

/// One logical line of a requirements file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementLine {
    Requirement(Requirement),
    /// `-r <file>` nested include (unexpanded)
    Include(PathBuf),
    /// `-c <file>` constraints reference
    Constraint(PathBuf),
    /// Any other pip option line (`--index-url ...`), kept verbatim
    Option(String),
}

impl RequirementLine {
    /// Parse one requirements-file line; `None` for blanks and comments
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(path) = option_value(line, &["-r", "--requirement"]) {
            return Ok(Some(RequirementLine::Include(PathBuf::from(path))));
        }
        if let Some(path) = option_value(line, &["-c", "--constraint"]) {
            return Ok(Some(RequirementLine::Constraint(PathBuf::from(path))));
        }
        if let Some(target) = option_value(line, &["-e", "--editable"]) {
            return Ok(Some(RequirementLine::Requirement(Requirement::Reference {
                name: None,
                raw: format!("-e {}", target),
            })));
        }
        if line.starts_with('-') {
            return Ok(Some(RequirementLine::Option(line.to_string())));
        }

        Requirement::parse(line).map(|r| Some(RequirementLine::Requirement(r)))
    }
}

impl fmt::Display for RequirementLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementLine::Requirement(req) => write!(f, "{}", req),
            RequirementLine::Include(path) => write!(f, "-r {}", path.display()),
            RequirementLine::Constraint(path) => write!(f, "-c {}", path.display()),
            RequirementLine::Option(raw) => f.write_str(raw),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    // pip only treats `#` as a comment when preceded by whitespace
    let comment = line
        .char_indices()
        .zip(line.chars().skip(1))
        .find(|((_, c), next)| c.is_whitespace() && *next == '#')
        .map(|((idx, _), _)| idx);
    match comment {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn option_value<'a>(line: &'a str, flags: &[&str]) -> Option<&'a str> {
    for flag in flags {
        if let Some(rest) = line.strip_prefix(flag) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.trim());
            }
            if rest.starts_with(char::is_whitespace) {
                return Some(rest.trim());
            }
        }
    }
    None
}

/// Read a requirements file, expanding `-r` includes relative to the including file
///
/// Constraint references are resolved to paths relative to the current
/// directory so callers can copy them.
pub fn parse_requirements_file(path: &Path) -> Result<Vec<RequirementLine>> {
    let mut visited = HashSet::new();
    let mut lines = Vec::new();
    collect_file(path, &mut visited, &mut lines)?;
    Ok(lines)
}

fn collect_file(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
    out: &mut Vec<RequirementLine>,
) -> Result<()> {
    let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(key) {
        return Err(RequirementError::IncludeCycle(path.display().to_string()));
    }

    let content = fs::read_to_string(path).map_err(|e| RequirementError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    for raw in content.lines() {
        match RequirementLine::parse(raw)? {
            None => {}
            Some(RequirementLine::Include(nested)) => {
                collect_file(&base.join(nested), visited, out)?;
            }
            Some(RequirementLine::Constraint(c)) => {
                out.push(RequirementLine::Constraint(base.join(c)));
            }
            Some(line) => out.push(line),
        }
    }
    Ok(())
}

/// Expand user-supplied requirement arguments into lines
///
/// Arguments may be plain requirement strings or `-r <file>` / `-c <file>`
/// references, matching what pip accepts on its command line.
pub fn expand_requirement_args(args: &[String]) -> Result<Vec<RequirementLine>> {
    let mut lines = Vec::new();
    for arg in args {
        match RequirementLine::parse(arg)? {
            None => return Err(RequirementError::Empty),
            Some(RequirementLine::Include(path)) => {
                lines.extend(parse_requirements_file(&path)?);
            }
            Some(line) => lines.push(line),
        }
    }
    Ok(lines)
}
