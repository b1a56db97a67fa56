//! Wildcard resource patterns.
//!
//! Grammar: segments separated by `.`. A segment is a literal, `*`, or
//! `**`. A non-final `*` matches exactly one segment; a final `*` matches
//! the remainder (one or more segments); `**` matches the remainder (zero
//! or more) and is only legal in final position. Invalid patterns are
//! rejected when the grant is created, not at evaluation time.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A parsed, validated resource pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: one segment, or the remainder when final
    Wild,
    /// `**`: the remainder (zero or more segments); final only
    DoubleWild,
}

impl ResourcePattern {
    /// Parse and validate a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty pattern, an empty
    /// segment, a `**` before the final position, or a `*` embedded in a
    /// literal (e.g. `foo*bar`).
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Validation("resource pattern is empty".to_string()));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(Error::Validation(format!(
                        "resource pattern '{raw}' has an empty segment"
                    )));
                }
                "*" => Segment::Wild,
                "**" => {
                    if i != last {
                        return Err(Error::Validation(format!(
                            "resource pattern '{raw}': '**' is only valid as the final segment"
                        )));
                    }
                    Segment::DoubleWild
                }
                literal if literal.contains('*') => {
                    return Err(Error::Validation(format!(
                        "resource pattern '{raw}': '*' cannot appear inside a segment"
                    )));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Test a concrete resource name against this pattern.
    #[must_use]
    pub fn matches(&self, resource: &str) -> bool {
        let parts: Vec<&str> = resource.split('.').collect();
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::DoubleWild => return true,
                Segment::Wild if i == last => {
                    // Final `*` swallows the remainder, at least one segment
                    return parts.len() > i;
                }
                Segment::Wild => {
                    if parts.len() <= i {
                        return false;
                    }
                }
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.len() == self.segments.len()
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.raw
    }
}

impl std::fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
