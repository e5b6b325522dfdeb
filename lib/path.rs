//! Normalized logical paths inside the mounted namespace.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while normalizing a logical path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path was empty.
    #[error("path is empty")]
    Empty,

    /// The path did not start with `/`.
    #[error("path '{0}' is not absolute")]
    NotAbsolute(String),

    /// The path contained a `..` component.
    #[error("path '{0}' escapes its parent")]
    ParentComponent(String),

    /// A child name contained a `/` or was `.`/`..`.
    #[error("'{0}' is not a valid entry name")]
    InvalidName(String),
}

/// A normalized, absolute path to an object in the store, e.g. `/photos/a.jpg`.
///
/// Normalization collapses repeated separators, drops `.` components and any
/// trailing `/`. The root is `/`. Cloning is a reference-count bump, so the
/// handle table can keep the same allocation in both of its indices.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(Arc<str>);

impl ObjectPath {
    /// The root of the namespace.
    #[must_use]
    pub fn root() -> Self {
        Self(Arc::from("/"))
    }

    /// Parse and normalize `raw`.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute(raw.to_owned()));
        }

        let mut normalized = String::with_capacity(raw.len());
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => return Err(PathError::ParentComponent(raw.to_owned())),
                name => {
                    normalized.push('/');
                    normalized.push_str(name);
                }
            }
        }

        if normalized.is_empty() {
            Ok(Self::root())
        } else {
            Ok(Self(Arc::from(normalized)))
        }
    }

    /// Append a single entry name.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(PathError::InvalidName(name.to_owned()));
        }
        if self.is_root() {
            Ok(Self(Arc::from(format!("/{name}"))))
        } else {
            Ok(Self(Arc::from(format!("{}/{name}", self.0))))
        }
    }

    /// The parent directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(Arc::from(&self.0[..idx]))),
            None => None,
        }
    }

    /// The final component, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Whether this is `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        &*self.0 == "/"
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the components, root excluded.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_collapses_separators_and_dots() {
        let p = ObjectPath::parse("//a/./b//c/").expect("valid path");
        assert_eq!(p.as_str(), "/a/b/c");
    }

    #[test]
    fn parse_root_variants() {
        for raw in ["/", "//", "/./"] {
            assert!(ObjectPath::parse(raw).expect("root").is_root(), "{raw}");
        }
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(ObjectPath::parse(""), Err(PathError::Empty));
        assert!(matches!(
            ObjectPath::parse("a/b"),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            ObjectPath::parse("/a/../b"),
            Err(PathError::ParentComponent(_))
        ));
    }

    #[test]
    fn join_and_parent_are_inverse() {
        let dir = ObjectPath::parse("/docs").expect("valid path");
        let file = dir.join("a.txt").expect("valid name");
        assert_eq!(file.as_str(), "/docs/a.txt");
        assert_eq!(file.parent(), Some(dir));
        assert_eq!(file.file_name(), Some("a.txt"));

        let top = ObjectPath::root().join("x").expect("valid name");
        assert_eq!(top.as_str(), "/x");
        assert_eq!(top.parent(), Some(ObjectPath::root()));
        assert_eq!(ObjectPath::root().parent(), None);
    }

    #[test]
    fn join_rejects_separators() {
        let root = ObjectPath::root();
        for name in ["", ".", "..", "a/b"] {
            assert!(root.join(name).is_err(), "{name:?}");
        }
    }
}
