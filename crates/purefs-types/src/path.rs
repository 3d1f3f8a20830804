//! Owned, normalized absolute VFS paths.
//!
//! A [`VfsPath`] always starts with `/`, never contains `.`/`..`/empty
//! components and never ends with `/` (except the root itself). Prefix tests
//! work on whole components, so `/ab` is not under `/a`.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errno::{Errno, VfsResult};

/// Longest accepted path, in bytes.
pub const PATH_MAX: usize = 4096;

/// Longest accepted single component, in bytes.
pub const NAME_MAX: usize = 255;

/// A normalized absolute path inside the VFS namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VfsPath(String);

impl VfsPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse an absolute path.
    ///
    /// Fails with `ENOENT` for an empty path and `EINVAL` for a relative one.
    pub fn new(path: &str) -> VfsResult<Self> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if !path.starts_with('/') {
            return Err(Errno::EINVAL);
        }
        Self::root().join(path)
    }

    /// Resolve `path` against `cwd` when it is relative.
    pub fn absolutize(cwd: &VfsPath, path: &str) -> VfsResult<Self> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if path.starts_with('/') {
            Self::new(path)
        } else {
            cwd.join(path)
        }
    }

    /// Join a relative path onto this one, normalizing as we go.
    ///
    /// A leading `/` in `rel` is ignored; `..` never climbs above the root.
    pub fn join(&self, rel: &str) -> VfsResult<Self> {
        let mut parts: Vec<&str> = self.components().collect();
        for part in rel.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => {
                    if name.len() > NAME_MAX {
                        return Err(Errno::ENAMETOOLONG);
                    }
                    parts.push(name);
                }
            }
        }
        let mut out = String::with_capacity(self.0.len() + rel.len() + 1);
        for part in &parts {
            out.push('/');
            out.push_str(part);
        }
        if out.is_empty() {
            out.push('/');
        }
        if out.len() > PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        Ok(Self(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Non-empty components, root first.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// True if `prefix` equals this path or is one of its ancestors.
    pub fn starts_with(&self, prefix: &VfsPath) -> bool {
        self.strip_prefix(prefix).is_some()
    }

    /// Strip a mount prefix, returning the remainder without a leading `/`.
    ///
    /// Returns `Some("")` when the paths are equal and `None` when `prefix`
    /// is not an ancestor of `self`.
    pub fn strip_prefix(&self, prefix: &VfsPath) -> Option<&str> {
        if prefix.is_root() {
            return Some(self.0.trim_start_matches('/'));
        }
        let rest = self.0.strip_prefix(prefix.as_str())?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Parent directory; `None` for the root.
    pub fn parent(&self) -> Option<VfsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// This path followed by each of its ancestors, ending with `/`.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: Some(&self.0),
        }
    }
}

/// Iterator returned by [`VfsPath::ancestors`], deepest first.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    next: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.next?;
        self.next = match current.rfind('/') {
            _ if current == "/" => None,
            Some(0) => Some("/"),
            Some(idx) => Some(&current[..idx]),
            None => None,
        };
        Some(current)
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VfsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for VfsPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for VfsPath {
    type Err = Errno;

    fn from_str(s: &str) -> VfsResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for VfsPath {
    type Error = Errno;

    fn try_from(s: String) -> VfsResult<Self> {
        Self::new(&s)
    }
}

impl From<VfsPath> for String {
    fn from(p: VfsPath) -> String {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s).unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("//a///b/").as_str(), "/a/b");
        assert_eq!(p("/a/./b/../c").as_str(), "/a/c");
        assert_eq!(p("/../..").as_str(), "/");
    }

    #[test]
    fn test_rejects_relative_and_empty() {
        assert_eq!(VfsPath::new("a/b"), Err(Errno::EINVAL));
        assert_eq!(VfsPath::new(""), Err(Errno::ENOENT));
    }

    #[test]
    fn test_absolutize() {
        let cwd = p("/user/music");
        assert_eq!(VfsPath::absolutize(&cwd, "song.mp3").unwrap().as_str(), "/user/music/song.mp3");
        assert_eq!(VfsPath::absolutize(&cwd, "../db").unwrap().as_str(), "/user/db");
        assert_eq!(VfsPath::absolutize(&cwd, "/sys").unwrap().as_str(), "/sys");
    }

    #[test]
    fn test_strip_prefix_is_component_aware() {
        assert_eq!(p("/a/b/c").strip_prefix(&p("/a")), Some("b/c"));
        assert_eq!(p("/a").strip_prefix(&p("/a")), Some(""));
        assert_eq!(p("/ab/c").strip_prefix(&p("/a")), None);
        assert_eq!(p("/a/b").strip_prefix(&VfsPath::root()), Some("a/b"));
        assert_eq!(VfsPath::root().strip_prefix(&VfsPath::root()), Some(""));
    }

    #[test]
    fn test_ancestors_deepest_first() {
        let path = p("/a/b/c");
        let all: Vec<_> = path.ancestors().collect();
        assert_eq!(all, vec!["/a/b/c", "/a/b", "/a", "/"]);
        assert_eq!(VfsPath::root().ancestors().collect::<Vec<_>>(), vec!["/"]);
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(p("/a/b").parent(), Some(p("/a")));
        assert_eq!(p("/a").parent(), Some(VfsPath::root()));
        assert_eq!(VfsPath::root().parent(), None);
        assert_eq!(p("/a/b.txt").file_name(), Some("b.txt"));
        assert_eq!(VfsPath::root().file_name(), None);
    }

    #[test]
    fn test_name_too_long() {
        let long = format!("/{}", "x".repeat(NAME_MAX + 1));
        assert_eq!(VfsPath::new(&long), Err(Errno::ENAMETOOLONG));
    }

    #[test]
    fn test_depth() {
        assert_eq!(VfsPath::root().depth(), 0);
        assert_eq!(p("/a/b").depth(), 2);
    }
}
