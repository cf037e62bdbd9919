//! Context Path Expressions
//!
//! Paths address values inside the execution context document.
//!
//! # Syntax
//!
//! - `$` - the whole document
//! - `$.repositories` - a top-level key
//! - `$.repository.name` - nested mapping traversal
//! - `$.chunks[0].content` - array indexing
//! - `repository.name` - bare form, equivalent to `$.repository.name`

use std::fmt;

use crate::error::PathError;

/// A single traversal step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPath {
    raw: String,
    segments: Vec<Segment>,
}

impl ContextPath {
    /// Parses a path expression.
    ///
    /// ```
    /// use maprunner::workflow::path::{ContextPath, Segment};
    ///
    /// let path = ContextPath::parse("$.chunks[2].id").unwrap();
    /// assert_eq!(
    ///     path.segments(),
    ///     &[
    ///         Segment::Key("chunks".into()),
    ///         Segment::Index(2),
    ///         Segment::Key("id".into()),
    ///     ]
    /// );
    /// ```
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| PathError::Invalid {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let body = match trimmed.strip_prefix('$') {
            Some("") => "",
            Some(rest) => match rest.chars().next() {
                Some('.') => &rest[1..],
                Some('[') => rest,
                _ => return Err(invalid("expected '.' or '[' after '$'")),
            },
            None => trimmed,
        };

        let mut segments = Vec::new();
        if body.is_empty() {
            return Ok(Self {
                raw: raw.to_string(),
                segments,
            });
        }

        for part in body.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if key.is_empty() {
                // Only a leading `[n]` directly after `$` may omit the key
                if !(segments.is_empty() && !rest.is_empty() && trimmed.starts_with("$[")) {
                    return Err(invalid("empty key"));
                }
            } else {
                segments.push(Segment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("unterminated '['"))?;
                let index = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("array index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid("unexpected characters after ']'"));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The root path `$`.
    pub fn root() -> Self {
        Self {
            raw: "$".to_string(),
            segments: Vec::new(),
        }
    }

    /// Extends the path by one mapping key.
    pub fn child(&self, key: &str) -> Self {
        let mut path = Self {
            raw: String::new(),
            segments: self.segments.clone(),
        };
        path.segments.push(Segment::Key(key.to_string()));
        path.raw = path.prefix(path.segments.len());
        path
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Leading key, if the path starts with one.
    pub fn head_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Renders the first `len` segments, used for error messages.
    pub fn prefix(&self, len: usize) -> String {
        let mut out = String::from("$");
        for segment in self.segments.iter().take(len) {
            match segment {
                Segment::Key(key) => {
                    out.push('.');
                    out.push_str(key);
                }
                Segment::Index(index) => out.push_str(&format!("[{}]", index)),
            }
        }
        out
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
