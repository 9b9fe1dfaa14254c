//! Data node paths and restricted predicate expressions.
//!
//! [`DataPath`] is the slash-separated path form used in `error-path`
//! elements, commit diffs, NACM rule paths, and leafref targets:
//! `/interfaces/interface[name='eth0']/mtu`. Prefixes are accepted and
//! ignored during matching; node matching is by local name.
//!
//! [`PathExpr`] is the restricted expression language accepted for schema
//! `when`/`must` constraints: a path, optionally compared to a literal.

use std::fmt;

use crate::xml::XmlNode;
use crate::PathError;

/// One step of a [`DataPath`]: a node name plus optional key predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    name: String,
    predicates: Vec<(String, String)>,
}

impl PathStep {
    /// Creates a step without predicates.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: strip_prefix(&name.into()),
            predicates: Vec::new(),
        }
    }

    /// Adds a `[key='value']` predicate.
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push((key.into(), value.into()));
        self
    }

    /// Node name (prefix already stripped).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key predicates in order.
    pub fn predicates(&self) -> &[(String, String)] {
        &self.predicates
    }

    fn matches(&self, node: &XmlNode) -> bool {
        if node.name() != self.name {
            return false;
        }
        self.predicates
            .iter()
            .all(|(k, v)| node.find_body(k) == Some(v.as_str()))
    }
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.predicates {
            write!(f, "[{}='{}']", k, v)?;
        }
        Ok(())
    }
}

/// A slash-separated data node path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPath {
    absolute: bool,
    steps: Vec<PathStep>,
}

impl DataPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self {
            absolute: true,
            steps: Vec::new(),
        }
    }

    /// Parses a path such as `/a/b[k='v']/c`.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let absolute = s.starts_with('/');
        let body = if absolute { &s[1..] } else { s };
        let mut steps = Vec::new();
        if body.is_empty() {
            return Ok(Self { absolute, steps });
        }
        for raw in split_steps(body)? {
            steps.push(parse_step(&raw)?);
        }
        Ok(Self { absolute, steps })
    }

    /// True if the path starts at the datastore root.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Path steps in order.
    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Appends a step, returning the extended path.
    pub fn join(&self, step: PathStep) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self {
            absolute: self.absolute,
            steps,
        }
    }

    /// All nodes under `root` matched by this path.
    ///
    /// The first step is matched against the children of `root`, so for an
    /// absolute path `root` is the datastore root element.
    pub fn resolve<'a>(&self, root: &'a XmlNode) -> Vec<&'a XmlNode> {
        let mut current = vec![root];
        for step in &self.steps {
            let mut next = Vec::new();
            for node in current {
                for child in node.children() {
                    if step.matches(child) {
                        next.push(child);
                    }
                }
            }
            if next.is_empty() {
                return Vec::new();
            }
            current = next;
        }
        current
    }

    /// First node matched by this path, if any.
    pub fn resolve_first<'a>(&self, root: &'a XmlNode) -> Option<&'a XmlNode> {
        self.resolve(root).into_iter().next()
    }

    /// True if this path equals `other` or names one of its ancestors.
    ///
    /// Predicates on `self` must be satisfied by the corresponding step of
    /// `other` for the step to match. This is the NACM rule-path containment
    /// test: a rule for `/a/b` governs `/a/b/c`.
    pub fn contains(&self, other: &DataPath) -> bool {
        if self.steps.len() > other.steps.len() {
            return false;
        }
        self.steps.iter().zip(&other.steps).all(|(mine, theirs)| {
            mine.name == theirs.name
                && mine
                    .predicates
                    .iter()
                    .all(|p| theirs.predicates.contains(p) || theirs.predicates.is_empty())
        })
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("/");
        }
        for step in &self.steps {
            write!(f, "/{}", step)?;
        }
        Ok(())
    }
}

fn strip_prefix(name: &str) -> String {
    name.rsplit(':').next().unwrap_or(name).to_string()
}

/// Splits on `/` outside predicates.
fn split_steps(s: &str) -> Result<Vec<String>, PathError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PathError::InvalidStep(s.to_string()))?;
                current.push(c);
            }
            '/' if depth == 0 => {
                if current.is_empty() {
                    return Err(PathError::InvalidStep(s.to_string()));
                }
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(PathError::UnterminatedPredicate(s.to_string()));
    }
    if current.is_empty() {
        return Err(PathError::InvalidStep(s.to_string()));
    }
    out.push(current);
    Ok(out)
}

fn parse_step(raw: &str) -> Result<PathStep, PathError> {
    let (name, rest) = match raw.find('[') {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, ""),
    };
    if name.is_empty() {
        return Err(PathError::InvalidStep(raw.to_string()));
    }
    let mut step = PathStep::new(name);
    let mut rest = rest;
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(PathError::InvalidStep(raw.to_string()));
        }
        let end = rest
            .find(']')
            .ok_or_else(|| PathError::UnterminatedPredicate(raw.to_string()))?;
        let inner = &rest[1..end];
        let (key, value) = inner
            .split_once('=')
            .ok_or_else(|| PathError::InvalidStep(raw.to_string()))?;
        let value = value.trim().trim_matches('\'').trim_matches('"');
        step = step.with_key(strip_prefix(key.trim()), value);
        rest = &rest[end + 1..];
    }
    Ok(step)
}

/// Restricted predicate expression for schema `when`/`must` constraints.
///
/// Supported forms: `path` (node exists), `path = 'literal'`, and
/// `path != 'literal'`. Absolute paths evaluate from the datastore root,
/// relative paths from the context node. `..` steps are not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathExpr {
    /// True when the path matches at least one node.
    Exists(DataPath),
    /// True when some matched node's body equals the literal.
    Equals(DataPath, String),
    /// True when no matched node's body equals the literal.
    NotEquals(DataPath, String),
}

impl PathExpr {
    /// Parses an expression such as `type = 'ethernet'` or `enabled`.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let s = s.trim();
        if let Some((lhs, rhs)) = s.split_once("!=") {
            let path = DataPath::parse(lhs.trim())?;
            return Ok(PathExpr::NotEquals(path, parse_literal(rhs)?));
        }
        if let Some((lhs, rhs)) = s.split_once('=') {
            let path = DataPath::parse(lhs.trim())?;
            return Ok(PathExpr::Equals(path, parse_literal(rhs)?));
        }
        Ok(PathExpr::Exists(DataPath::parse(s)?))
    }

    /// Evaluates against a context node and the datastore root.
    pub fn eval(&self, ctx: &XmlNode, root: &XmlNode) -> bool {
        match self {
            PathExpr::Exists(path) => !path.resolve(base(path, ctx, root)).is_empty(),
            PathExpr::Equals(path, literal) => path
                .resolve(base(path, ctx, root))
                .iter()
                .any(|n| n.body() == Some(literal.as_str())),
            PathExpr::NotEquals(path, literal) => {
                let nodes = path.resolve(base(path, ctx, root));
                !nodes.is_empty() && nodes.iter().all(|n| n.body() != Some(literal.as_str()))
            }
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathExpr::Exists(p) => write!(f, "{}", p),
            PathExpr::Equals(p, v) => write!(f, "{} = '{}'", p, v),
            PathExpr::NotEquals(p, v) => write!(f, "{} != '{}'", p, v),
        }
    }
}

fn base<'a>(path: &DataPath, ctx: &'a XmlNode, root: &'a XmlNode) -> &'a XmlNode {
    if path.is_absolute() {
        root
    } else {
        ctx
    }
}

fn parse_literal(s: &str) -> Result<String, PathError> {
    let s = s.trim();
    let inner = s
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .ok_or_else(|| PathError::InvalidExpr(s.to_string()))?;
    Ok(inner.to_string())
}
