use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// One step of a structural path: a property key, optionally followed by the name of
/// an item inside that collection property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub key: String,
    pub item: Option<String>,
}

/// Stable structural path into a property tree, e.g. `pose_bones["Hand.L"].custom_shape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyPath {
    segments: Vec<PathSegment>,
}

impl PropertyPath {
    pub fn root(key: impl Into<String>) -> Self {
        Self {
            segments: vec![PathSegment {
                key: key.into(),
                item: None,
            }],
        }
    }

    /// Path to the field `key` of the collection item `item` found under this path's
    /// last property.
    pub fn child(&self, item: impl Into<String>, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            last.item = Some(item.into());
        }
        segments.push(PathSegment {
            key: key.into(),
            item: None,
        });
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidPath {
            path: input.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut chars = input.chars().peekable();

        loop {
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    key.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if key.is_empty() {
                return Err(invalid("empty key"));
            }

            let mut item = None;
            if chars.peek() == Some(&'[') {
                chars.next();
                if chars.next() != Some('"') {
                    return Err(invalid("expected '\"' after '['"));
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => name.push(c),
                            _ => return Err(invalid("bad escape in item name")),
                        },
                        Some('"') => break,
                        Some(c) => name.push(c),
                        None => return Err(invalid("unterminated item name")),
                    }
                }
                if chars.next() != Some(']') {
                    return Err(invalid("expected ']'"));
                }
                item = Some(name);
            }

            segments.push(PathSegment { key, item });

            match chars.next() {
                None => break,
                Some('.') => continue,
                Some(c) => return Err(invalid(&format!("unexpected character {c:?}"))),
            }
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.key)?;
            if let Some(item) = &segment.item {
                f.write_str("[\"")?;
                for c in item.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"]")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for PropertyPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
