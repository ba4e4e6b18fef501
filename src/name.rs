use std::{borrow::Borrow, fmt, sync::Arc};

use serde::Serialize;

use crate::error::Error;

/// Longest accepted well-known name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Checks a candidate well-known name.
///
/// A name is a `.`-separated sequence of at least two elements, each one or
/// more of `[A-Za-z0-9_-]` with a non-digit first byte, and no longer than
/// [`MAX_NAME_LEN`] in total. Leading, trailing and doubled `.` all produce
/// an empty element and are rejected. Never allocates.
pub fn is_valid(name: &[u8]) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let mut elements = 0usize;
    for element in name.split(|&b| b == b'.') {
        if !is_valid_element(element) {
            return false;
        }
        elements += 1;
    }

    elements >= 2
}

fn is_valid_element(element: &[u8]) -> bool {
    match element {
        [] => false,
        [first, ..] if first.is_ascii_digit() => false,
        _ => element
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'),
    }
}

/// A validated well-known name.
///
/// Cheap to clone; the registry and the per-connection back-reference sets
/// all key on this type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Name(Arc<str>);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets map lookups take a plain `&str`.
impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Error> {
        if is_valid(s.as_bytes()) {
            Ok(Self(s.into()))
        } else {
            Err(Error::InvalidName(s.to_string()))
        }
    }
}

impl TryFrom<String> for Name {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        Self::try_from(s.as_str())
    }
}
