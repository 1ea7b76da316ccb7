//! Local ↔ remote path mapping and ignore rules.
//!
//! Every component asks the same [`PathPolicy`] whether a path takes part
//! in synchronization, so upload, watch and sync agree on what is ignored.
//!
//! Glob syntax is that of the `glob` crate: `*` matches within one path
//! segment, `**` across segments, `?` one character and `[...]` a class.
//! A pattern ending in `/`
//! matches that directory and everything below it. A pattern without `/`
//! is tested against each component of the workspace-relative path, a
//! pattern with `/` against the whole relative path.

use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use sitesync_common::{RemotePath, SiteConfig, CONFIG_FILE_NAME};

/// Patterns every workspace ignores.
pub const BUILTIN_IGNORES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".vscode",
    ".idea",
    "node_modules",
    ".DS_Store",
    "Thumbs.db",
    "*.log",
    CONFIG_FILE_NAME,
];

/// `*` and `?` never cross a `/`; a leading `.` needs no literal match.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One compiled glob pattern.
#[derive(Debug, Clone)]
struct Glob {
    pattern: Pattern,
    /// Also match everything below a matching directory.
    dir_prefix: bool,
    /// Match against the whole relative path instead of single components.
    anchored: bool,
}

impl Glob {
    fn compile(pattern: &str) -> Option<Self> {
        let (body, dir_prefix) = match pattern.strip_suffix('/') {
            Some(body) => (body, true),
            None => (pattern, false),
        };
        let body = body.trim_start_matches("./");
        if body.is_empty() {
            return None;
        }

        match Pattern::new(body) {
            Ok(compiled) => Some(Self {
                pattern: compiled,
                dir_prefix,
                anchored: dir_prefix || body.contains('/'),
            }),
            Err(e) => {
                warn!(pattern, "Skipping invalid ignore pattern: {}", e);
                None
            }
        }
    }

    fn is_match(&self, candidate: &str) -> bool {
        self.pattern.matches_with(candidate, MATCH_OPTIONS)
    }

    fn matches(&self, relative: &str) -> bool {
        if !self.anchored {
            return relative.split('/').any(|c| self.is_match(c));
        }
        if !self.dir_prefix {
            return self.is_match(relative);
        }
        // The path itself or any of its ancestors.
        relative
            .match_indices('/')
            .map(|(i, _)| &relative[..i])
            .chain(std::iter::once(relative))
            .any(|prefix| self.is_match(prefix))
    }
}

/// Built-in plus caller-supplied ignore patterns.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    globs: Vec<Glob>,
}

impl IgnoreRules {
    pub fn new(extra: &[String]) -> Self {
        let globs = BUILTIN_IGNORES
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
            .filter_map(Glob::compile)
            .collect();
        Self { globs }
    }

    /// Check a workspace-relative, `/`-separated path.
    pub fn is_ignored(&self, relative: &str) -> bool {
        !relative.is_empty() && self.globs.iter().any(|g| g.matches(relative))
    }
}

/// Workspace-relative form of `local` with `/` separators.
///
/// Returns `None` when `local` is not inside `workspace_root`. The root
/// itself maps to the empty string.
pub fn relative_path(local: &Path, workspace_root: &Path) -> Option<String> {
    let rest = local.strip_prefix(workspace_root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Map a local path to its remote counterpart under `remote_root`.
pub fn to_remote_path(
    local: &Path,
    workspace_root: &Path,
    remote_root: &RemotePath,
) -> Option<RemotePath> {
    relative_path(local, workspace_root).map(|rel| remote_root.join_relative(&rel))
}

/// Check `path` against the built-in ignores and `extra` patterns.
///
/// Paths outside the workspace are never ignored by this check; callers
/// reject them separately.
pub fn should_ignore(path: &Path, workspace_root: &Path, extra: &[String]) -> bool {
    relative_path(path, workspace_root)
        .map(|rel| IgnoreRules::new(extra).is_ignored(&rel))
        .unwrap_or(false)
}

/// Path rules for one workspace and site.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace_root: PathBuf,
    remote_root: RemotePath,
    ignore: IgnoreRules,
    watch: Option<Glob>,
}

impl PathPolicy {
    /// Build the policy for `config` with `workspace_root` as local root.
    pub fn new(workspace_root: impl Into<PathBuf>, config: &SiteConfig) -> Self {
        let files = config.watcher.files.trim();
        let watch = if files == "**/*" || files == "**" {
            None
        } else {
            Glob::compile(files).map(|g| Glob {
                anchored: true,
                ..g
            })
        };
        Self {
            workspace_root: workspace_root.into(),
            remote_root: config.remote_root(),
            ignore: IgnoreRules::new(&config.ignore),
            watch,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn remote_root(&self) -> &RemotePath {
        &self.remote_root
    }

    /// Workspace-relative path, `None` outside the workspace.
    pub fn relative(&self, local: &Path) -> Option<String> {
        relative_path(local, &self.workspace_root)
    }

    /// Remote counterpart of `local`, `None` outside the workspace.
    pub fn remote_path(&self, local: &Path) -> Option<RemotePath> {
        to_remote_path(local, &self.workspace_root, &self.remote_root)
    }

    /// Local counterpart of `remote`, `None` outside the remote root.
    pub fn local_path(&self, remote: &RemotePath) -> Option<PathBuf> {
        let root = self.remote_root.components();
        let components = remote.components();
        if remote.is_absolute() != self.remote_root.is_absolute()
            || !components.starts_with(root)
        {
            return None;
        }
        Some(
            components[root.len()..]
                .iter()
                .fold(self.workspace_root.clone(), |path, c| path.join(c)),
        )
    }

    /// Whether `local` is excluded by ignore rules.
    pub fn is_ignored(&self, local: &Path) -> bool {
        self.relative(local)
            .map(|rel| self.ignore.is_ignored(&rel))
            .unwrap_or(false)
    }

    /// Whether `local` is inside the workspace and not ignored.
    pub fn is_tracked(&self, local: &Path) -> bool {
        match self.relative(local) {
            Some(rel) => !self.ignore.is_ignored(&rel),
            None => false,
        }
    }

    /// Whether watcher events for `local` are considered at all.
    pub fn is_watched(&self, local: &Path) -> bool {
        let Some(rel) = self.relative(local) else {
            return false;
        };
        if self.ignore.is_ignored(&rel) {
            return false;
        }
        self.watch.as_ref().map_or(true, |g| g.matches(&rel))
    }
}
