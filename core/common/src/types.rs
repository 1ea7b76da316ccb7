//! Common types used throughout sitesync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A path on the remote server.
///
/// Remote paths always use `/` as separator regardless of the local
/// platform. A path is either absolute (`/var/www`) or relative to the
/// login directory of the remote account (`public_html`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    absolute: bool,
    components: Vec<String>,
}

impl RemotePath {
    /// Create the absolute root path.
    pub fn root() -> Self {
        Self {
            absolute: true,
            components: Vec::new(),
        }
    }

    /// Parse a path string into RemotePath.
    ///
    /// Both `/` and `\` are accepted as separators, empty and `.` segments
    /// are dropped and `..` removes the previous segment.
    pub fn parse(path: &str) -> Self {
        let normalized = path.replace('\\', "/");
        let absolute = normalized.starts_with('/');
        let mut components: Vec<String> = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                other => components.push(other.to_string()),
            }
        }
        Self {
            absolute,
            components,
        }
    }

    /// Check if this path has no components.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Check if this path starts at the server root.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self {
                absolute: self.absolute,
                components,
            })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a single child component.
    ///
    /// # Errors
    /// - Returns error if `child` is empty, a dot segment or contains separators
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        if child.is_empty() || child == "." || child == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid path component: '{}'",
                child
            )));
        }
        if child.contains('/') || child.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Child component cannot contain separators".to_string(),
            ));
        }
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self {
            absolute: self.absolute,
            components,
        })
    }

    /// Append a relative, possibly multi-segment path.
    pub fn join_relative(&self, relative: &str) -> Self {
        let tail = Self::parse(relative);
        let mut components = self.components.clone();
        components.extend(tail.components);
        Self {
            absolute: self.absolute,
            components,
        }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to the string form sent to the server.
    pub fn to_string_path(&self) -> String {
        match (self.absolute, self.is_root()) {
            (true, true) => "/".to_string(),
            (true, false) => format!("/{}", self.components.join("/")),
            (false, true) => ".".to_string(),
            (false, false) => self.components.join("/"),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_remote_path_root() {
        let path = RemotePath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
    }

    #[test]
    fn test_remote_path_parse() {
        let path = RemotePath::parse("/var//www/./site/");
        assert_eq!(path.components(), &["var", "www", "site"]);
        assert_eq!(path.to_string_path(), "/var/www/site");
    }

    #[test]
    fn test_remote_path_backslashes() {
        let path = RemotePath::parse("public_html\\assets\\app.js");
        assert!(!path.is_absolute());
        assert_eq!(path.to_string_path(), "public_html/assets/app.js");
    }

    #[test]
    fn test_remote_path_dot_dot() {
        let path = RemotePath::parse("/srv/app/../www");
        assert_eq!(path.to_string_path(), "/srv/www");
    }

    #[test]
    fn test_relative_root() {
        assert_eq!(RemotePath::parse("").to_string_path(), ".");
    }

    #[test]
    fn test_remote_path_join() {
        let path = RemotePath::root().join("foo").unwrap().join("bar").unwrap();
        assert_eq!(path.to_string_path(), "/foo/bar");
        assert!(path.join("a/b").is_err());
        assert!(path.join("..").is_err());
    }

    #[test]
    fn test_remote_path_parent_and_name() {
        let path = RemotePath::parse("/foo/bar");
        assert_eq!(path.name(), Some("bar"));
        assert_eq!(path.parent().unwrap().to_string_path(), "/foo");
        assert!(RemotePath::root().parent().is_none());
    }

    proptest! {
        #[test]
        fn prop_join_relative_never_emits_backslash(
            segments in proptest::collection::vec("[a-zA-Z0-9_.-]{1,8}", 1..6)
        ) {
            let relative = segments.join("\\");
            let joined = RemotePath::parse("/srv").join_relative(&relative);
            let rendered = joined.to_string_path();
            prop_assert!(!rendered.contains('\\'));
            prop_assert!(rendered.starts_with("/"));
        }
    }
}
