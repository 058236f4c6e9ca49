//! Endpoint path templates.
//!
//! A template is a `/`-separated path where a `{name}` segment matches any
//! single segment and a final `*` matches whatever remains (including
//! nothing). Concrete request paths are normalized to the template they
//! match so that `/items/1` and `/items/2` share the accounting of
//! `/items/{id}`. Empty segments are ignored, so `/items/1/` and `//items/1`
//! normalize the same way.

use std::fmt;

use crate::error::{DynLimitsError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param,
    Rest,
}

/// A parsed endpoint path template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PathTemplate {
    /// Parse a template such as `/endpoint_a/{id}` or `/static/*`.
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(DynLimitsError::Rules(format!(
                "endpoint template '{raw}' must start with '/'"
            )));
        }

        let parts: Vec<&str> = split(raw).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let segment = if *part == "*" {
                if idx + 1 != parts.len() {
                    return Err(DynLimitsError::Rules(format!(
                        "endpoint template '{raw}': '*' is only allowed as the last segment"
                    )));
                }
                Segment::Rest
            } else if part.starts_with('{') && part.ends_with('}') && part.len() > 2 {
                Segment::Param
            } else if part.contains(['{', '}', '*']) {
                return Err(DynLimitsError::Rules(format!(
                    "endpoint template '{raw}': malformed segment '{part}'"
                )));
            } else {
                Segment::Literal((*part).to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The template as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete request path matches this template.
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split(path);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Param => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match parts.next() {
                    Some(part) if part == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    /// Whether some request path exists that both templates match.
    pub fn overlaps(&self, other: &PathTemplate) -> bool {
        fn overlap(a: &[Segment], b: &[Segment]) -> bool {
            match (a.first(), b.first()) {
                (None, None) => true,
                (Some(Segment::Rest), _) | (_, Some(Segment::Rest)) => true,
                (None, Some(_)) | (Some(_), None) => false,
                (Some(x), Some(y)) => {
                    let compatible = match (x, y) {
                        (Segment::Literal(l), Segment::Literal(r)) => l == r,
                        _ => true,
                    };
                    compatible && overlap(&a[1..], &b[1..])
                }
            }
        }
        overlap(&self.segments, &other.segments)
    }

    // Literal segments first, then fixed-length templates.
    fn specificity(&self) -> (usize, bool, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let fixed = !matches!(self.segments.last(), Some(Segment::Rest));
        (literals, fixed, self.segments.len())
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Known endpoint templates, most specific first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    templates: Vec<PathTemplate>,
}

impl RouteTable {
    /// Build a table from templates, dropping duplicates.
    pub fn new(mut templates: Vec<PathTemplate>) -> Self {
        templates.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then_with(|| a.raw.cmp(&b.raw))
        });
        templates.dedup_by(|a, b| a.raw == b.raw);
        Self { templates }
    }

    /// The most specific template matching a request path, if any.
    pub fn normalize(&self, path: &str) -> Option<&str> {
        self.templates
            .iter()
            .find(|t| t.matches(path))
            .map(PathTemplate::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
