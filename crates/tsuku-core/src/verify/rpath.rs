//! Run-time path variable expansion (`$ORIGIN`, `@rpath` and friends).

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Upper bound on search path entries per binary.
pub const MAX_RPATH_ENTRIES: usize = 100;

/// Upper bound on any path before or after expansion (Linux `PATH_MAX`).
pub const MAX_PATH_LEN: usize = 4096;

const ORIGIN_PREFIXES: &[&str] = &["${ORIGIN}", "$ORIGIN", "@loader_path", "@executable_path"];
const RPATH_PREFIX: &str = "@rpath";
const DYLD_TOKENS: &[&str] = &["@rpath", "@loader_path", "@executable_path"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    #[error("binary has {0} RPATH entries (limit: {MAX_RPATH_ENTRIES})")]
    TooManyRpaths(usize),

    #[error("path exceeds {MAX_PATH_LEN} bytes")]
    TooLong,

    #[error("path contains unexpanded variable: {0}")]
    Unexpanded(String),

    #[error("@rpath cannot be expanded (no RPATH entries in binary)")]
    NoRpath,

    #[error("{} resolves outside the managed root", .0.display())]
    OutsideRoot(PathBuf),
}

/// Whether `name` starts with a variable the loader expands at run time.
pub fn is_path_variable(name: &str) -> bool {
    ORIGIN_PREFIXES
        .iter()
        .chain(std::iter::once(&RPATH_PREFIX))
        .any(|p| name.starts_with(p))
}

/// `$X`, `${X}` or a dyld `@` token left in a path after expansion. Any
/// other `@` is an ordinary path character.
fn contains_variable(path: &str) -> bool {
    let dollar = path.as_bytes().windows(2).any(|w| match w {
        [b'$', next] => next.is_ascii_alphabetic() || *next == b'{',
        _ => false,
    });
    dollar || DYLD_TOKENS.iter().any(|t| path.contains(t))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the filesystem root stays at the root.
                if !out.pop() && !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Replace a leading origin-style variable with `origin`.
fn substitute_origin(value: &str, origin: &Path) -> Option<PathBuf> {
    ORIGIN_PREFIXES.iter().find_map(|prefix| {
        let rest = value.strip_prefix(prefix)?;
        if rest.is_empty() {
            return Some(origin.to_path_buf());
        }
        rest.strip_prefix('/').map(|r| origin.join(r))
    })
}

/// Expansion context for the dependencies of one binary.
#[derive(Debug, Clone)]
pub struct SearchContext {
    origin: PathBuf,
    rpaths: Vec<String>,
    root: PathBuf,
}

impl SearchContext {
    /// `binary` is the absolute path of the declaring file and `root` the
    /// managed root that variable expansions must stay inside.
    ///
    /// # Errors
    ///
    /// Returns [`ExpandError`] when the search path breaks the entry or
    /// length limits.
    pub fn new(binary: &Path, rpaths: &[String], root: &Path) -> Result<Self, ExpandError> {
        if rpaths.len() > MAX_RPATH_ENTRIES {
            return Err(ExpandError::TooManyRpaths(rpaths.len()));
        }
        if rpaths.iter().any(|r| r.len() > MAX_PATH_LEN) {
            return Err(ExpandError::TooLong);
        }
        let origin = binary.parent().unwrap_or(binary).to_path_buf();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| normalize(root));
        Ok(Self {
            origin,
            rpaths: rpaths.to_vec(),
            root,
        })
    }

    /// Expand `dep` into a concrete path.
    ///
    /// Names without a variable are returned as written. `@rpath` tries each
    /// search path entry in order and takes the first candidate that exists,
    /// falling back to the first candidate.
    ///
    /// # Errors
    ///
    /// Returns [`ExpandError`] for over-long paths, leftover variables, or an
    /// expansion that leaves the managed root.
    pub fn expand(&self, dep: &str) -> Result<PathBuf, ExpandError> {
        if dep.len() > MAX_PATH_LEN {
            return Err(ExpandError::TooLong);
        }
        if !is_path_variable(dep) {
            return Ok(PathBuf::from(dep));
        }

        let expanded = if let Some(rest) = dep.strip_prefix(RPATH_PREFIX) {
            self.expand_rpath(rest.trim_start_matches('/'))?
        } else {
            substitute_origin(dep, &self.origin)
                .map(|p| normalize(&p))
                .ok_or_else(|| ExpandError::Unexpanded(dep.to_string()))?
        };

        let text = expanded.to_string_lossy();
        if contains_variable(&text) {
            return Err(ExpandError::Unexpanded(text.into_owned()));
        }
        if text.len() > MAX_PATH_LEN {
            return Err(ExpandError::TooLong);
        }

        let resolved = std::fs::canonicalize(&expanded).unwrap_or(expanded);
        if !resolved.starts_with(&self.root) {
            return Err(ExpandError::OutsideRoot(resolved));
        }
        Ok(resolved)
    }

    fn expand_rpath(&self, suffix: &str) -> Result<PathBuf, ExpandError> {
        let mut first = None;
        for entry in &self.rpaths {
            let base = substitute_origin(entry, &self.origin).unwrap_or_else(|| PathBuf::from(entry));
            let candidate = normalize(&base.join(suffix));
            if candidate.exists() {
                return Ok(candidate);
            }
            first.get_or_insert(candidate);
        }
        first.ok_or(ExpandError::NoRpath)
    }
}
