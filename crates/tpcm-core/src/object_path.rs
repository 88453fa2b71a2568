//! Validated object paths.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TpError, TpResult};

/// A syntactically valid object path: `/`, or `/`-separated non-empty
/// elements of `[A-Za-z0-9_]`, with no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates and wraps `path`.
    pub fn new(path: impl Into<String>) -> TpResult<Self> {
        let path = path.into();
        if is_valid_object_path(&path) {
            Ok(Self(path))
        } else {
            Err(TpError::invalid_argument(format!(
                "{path:?} is not a valid object path"
            )))
        }
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Appends one element, which must itself be a valid path element.
    pub fn child(&self, element: &str) -> TpResult<Self> {
        if self.0 == "/" {
            Self::new(format!("/{element}"))
        } else {
            Self::new(format!("{}/{element}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks object path syntax without allocating.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

impl TryFrom<String> for ObjectPath {
    type Error = TpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.0
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_syntax() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/freedesktop/Telepathy"));
        assert!(is_valid_object_path("/a_1/B2"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("org/x"));
        assert!(!is_valid_object_path("/org/"));
        assert!(!is_valid_object_path("/org//x"));
        assert!(!is_valid_object_path("/org/x-y"));
    }

    #[test]
    fn child_paths() {
        let root = ObjectPath::root();
        let a = root.child("org").unwrap();
        assert_eq!(a.as_str(), "/org");
        assert_eq!(a.child("Text0").unwrap().as_str(), "/org/Text0");
        assert!(a.child("bad.element").is_err());
    }
}
