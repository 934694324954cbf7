//! Topic patterns for event routing.
//!
//! Topics are `:`-separated segment strings (`agent:builder:response`). A
//! pattern is the same shape where `*` stands for exactly one segment, so
//! `agent:*:response` matches `agent:builder:response` but not
//! `agent:response` or `agent:a:b:response`. Patterns are parsed into an
//! explicit segment list and compared structurally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Separator between topic segments.
pub const TOPIC_SEPARATOR: char = ':';

/// Wildcard token matching exactly one segment.
pub const WILDCARD: &str = "*";

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Literal(String),
    Wildcard,
}

/// A parsed topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern string.
    ///
    /// Rejects empty patterns and empty segments (`a::b`, trailing `:`).
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::validation("topic pattern cannot be empty"));
        }

        let mut segments = Vec::new();
        for raw in pattern.split(TOPIC_SEPARATOR) {
            if raw.is_empty() {
                return Err(Error::validation(format!(
                    "topic pattern '{pattern}' contains an empty segment"
                )));
            }
            if raw == WILDCARD {
                segments.push(Segment::Wildcard);
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        Ok(Self { segments })
    }

    /// Structural match against a concrete topic string.
    ///
    /// A wildcard consumes exactly one segment; segment counts must be equal.
    pub fn matches(&self, topic: &str) -> bool {
        let mut count = 0;
        for (i, part) in topic.split(TOPIC_SEPARATOR).enumerate() {
            count += 1;
            match self.segments.get(i) {
                Some(Segment::Wildcard) => {
                    if part.is_empty() {
                        return false;
                    }
                }
                Some(Segment::Literal(lit)) => {
                    if lit != part {
                        return false;
                    }
                }
                None => return false,
            }
        }
        count == self.segments.len()
    }

    /// True when the pattern contains no wildcards.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            match segment {
                Segment::Literal(lit) => f.write_str(lit)?,
                Segment::Wildcard => f.write_str(WILDCARD)?,
            }
        }
        Ok(())
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
