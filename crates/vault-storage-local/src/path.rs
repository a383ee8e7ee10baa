//! Confinement of caller-supplied paths to the storage root.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Maps vault-relative paths onto absolute paths beneath a fixed root.
///
/// This is the only place logical paths become filesystem paths. Every resolved
/// path is textually prefixed by the root: `.` and empty segments are dropped,
/// and so are `..` segments and anything else that is not a plain file name
/// (a Windows drive prefix such as `C:` would otherwise replace the root).
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

/// A list prefix split into the directory to scan and the filename filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTarget {
    /// Absolute directory to scan
    pub dir: PathBuf,
    /// Filenames must start with this
    pub name_prefix: String,
}

impl PathResolver {
    /// Create a resolver rooted at `root`, made absolute against the current directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        Ok(Self {
            root: normalize(&root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Split a logical path into its sanitized segments.
    pub fn segments(path: &str) -> Vec<&str> {
        path.split(['/', '\\']).filter(|s| is_plain_name(s)).collect()
    }

    /// The canonical logical form of `path`: sanitized segments joined with `/`.
    pub fn logical(path: &str) -> String {
        Self::segments(path).join("/")
    }

    /// Resolve a logical path to an absolute path inside the root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for segment in Self::segments(path) {
            resolved.push(segment);
        }
        resolved
    }

    /// Compute the logical path of an absolute path inside the root.
    ///
    /// Returns `None` for paths outside the root.
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        let segments: Vec<_> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Option<_>>()?;
        Some(segments.join("/"))
    }

    /// Interpret a list prefix.
    ///
    /// An empty prefix, or one ending in a separator, names a directory whose
    /// direct children are listed. Anything else is a directory plus a filename prefix.
    pub fn list_target(&self, prefix: &str) -> ListTarget {
        let mut segments = Self::segments(prefix);
        let is_dir = prefix.is_empty() || prefix.ends_with(['/', '\\']);
        let name_prefix = if is_dir {
            String::new()
        } else {
            segments.pop().unwrap_or_default().to_string()
        };

        let mut dir = self.root.clone();
        for segment in segments {
            dir.push(segment);
        }
        ListTarget { dir, name_prefix }
    }
}

/// Whether `segment` is exactly one normal component, safe to push onto the root.
fn is_plain_name(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Lexically fold `.` and `..` out of an absolute root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("/tmp/vault").unwrap()
    }

    #[test]
    fn test_resolve_plain() {
        let r = resolver();
        assert_eq!(r.resolve("notes/a.md"), Path::new("/tmp/vault/notes/a.md"));
        assert_eq!(r.resolve("/notes/a.md"), Path::new("/tmp/vault/notes/a.md"));
        assert_eq!(r.resolve("./notes//a.md"), Path::new("/tmp/vault/notes/a.md"));
        assert_eq!(r.resolve(""), Path::new("/tmp/vault"));
    }

    #[test]
    fn test_traversal_never_escapes_root() {
        let r = resolver();
        let hostile = [
            "..",
            "../etc/passwd",
            "../../../../etc/shadow",
            "notes/../../secret",
            "notes/../..",
            "/../..//../x",
            "..\\..\\windows\\system32",
            "a/b/../../../../c",
            "./../.",
            "....//x",
            "C:evil/x",
            "C:/x",
            "C:",
            "\\\\server\\share\\x",
        ];
        for input in hostile {
            let resolved = r.resolve(input);
            assert!(
                resolved.starts_with(r.root()),
                "{input:?} resolved outside root: {}",
                resolved.display()
            );
            assert!(
                !resolved.components().any(|c| c == Component::ParentDir),
                "{input:?} kept a parent segment"
            );
        }
        assert_eq!(r.resolve("../etc/passwd"), Path::new("/tmp/vault/etc/passwd"));
        assert_eq!(r.resolve("notes/../../secret"), Path::new("/tmp/vault/notes/secret"));
        assert!(r.list_target("C:evil/x").dir.starts_with(r.root()));
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("a.md"));
        assert!(is_plain_name("...."));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name("."));
        assert!(!is_plain_name(".."));
    }

    #[cfg(windows)]
    #[test]
    fn test_drive_prefixes_dropped() {
        assert!(!is_plain_name("C:"));
        assert!(!is_plain_name("C:evil"));
        assert_eq!(PathResolver::segments("C:evil/x"), vec!["x"]);
    }

    #[test]
    fn test_root_is_normalized() {
        let r = PathResolver::new("/tmp/./other/../vault").unwrap();
        assert_eq!(r.root(), Path::new("/tmp/vault"));
    }

    #[test]
    fn test_logical_and_relative() {
        let r = resolver();
        assert_eq!(PathResolver::logical("/notes\\sub/./a.md"), "notes/sub/a.md");
        assert_eq!(
            r.relative(Path::new("/tmp/vault/notes/a.md")).as_deref(),
            Some("notes/a.md")
        );
        assert_eq!(r.relative(Path::new("/tmp/elsewhere/a.md")), None);
    }

    #[test]
    fn test_list_target() {
        let r = resolver();
        assert_eq!(
            r.list_target("notes/"),
            ListTarget {
                dir: PathBuf::from("/tmp/vault/notes"),
                name_prefix: String::new(),
            }
        );
        assert_eq!(
            r.list_target("notes/pre"),
            ListTarget {
                dir: PathBuf::from("/tmp/vault/notes"),
                name_prefix: "pre".to_string(),
            }
        );
        assert_eq!(
            r.list_target(""),
            ListTarget {
                dir: PathBuf::from("/tmp/vault"),
                name_prefix: String::new(),
            }
        );
        assert_eq!(r.list_target("da").name_prefix, "da");
        assert_eq!(r.list_target("../../").dir, PathBuf::from("/tmp/vault"));
    }
}
