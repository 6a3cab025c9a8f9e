//! Path translation between the sandbox namespace and the host filesystem.
//!
//! A sandboxed session sees two mounted areas:
//!
//!   {uploads_marker}/{filename}   files uploaded into the chat
//!   {shared_marker}/{relative}    the container's shared working area
//!
//! On the host these live under:
//!
//!   {uploads_root}/{chat_key}/{filename}
//!   {sandboxes_root}/{container_key}/{relative}
//!
//! Translation is purely lexical. Nothing here touches the filesystem,
//! so symlinks inside the host areas are the caller's concern.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::BridgeConfig;

/// Why a sandbox path could not be mapped to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{0}' is neither under the uploads nor the shared area")]
    UnknownPrefix(String),

    #[error("path '{path}' requires a {context} but none was provided")]
    MissingContext { path: String, context: &'static str },

    #[error("invalid {context}: '{value}'")]
    InvalidContext { context: &'static str, value: String },

    #[error("path '{0}' escapes the sandbox root")]
    Traversal(String),

    #[error("path '{0}' does not name a file")]
    NoFileName(String),
}

/// Which mounted area a sandbox path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Uploads,
    Shared,
}

#[derive(Debug, Clone)]
pub struct PathTranslator {
    sandbox_root: PathBuf,
    uploads_marker: PathBuf,
    shared_marker: PathBuf,
    uploads_root: PathBuf,
    sandboxes_root: PathBuf,
}

impl PathTranslator {
    pub fn new(config: &BridgeConfig) -> Self {
        let sandbox_root = lexical_normalize(&config.sandbox_root, Path::new("/"))
            .unwrap_or_else(|| PathBuf::from("/"));
        let uploads_marker = lexical_normalize(&config.uploads_marker, &sandbox_root)
            .unwrap_or_else(|| sandbox_root.join("uploads"));
        let shared_marker = lexical_normalize(&config.shared_marker, &sandbox_root)
            .unwrap_or_else(|| sandbox_root.join("shared"));

        Self {
            sandbox_root,
            uploads_marker,
            shared_marker,
            uploads_root: config.uploads_root.clone(),
            sandboxes_root: config.sandboxes_root.clone(),
        }
    }

    pub fn uploads_marker(&self) -> &Path {
        &self.uploads_marker
    }

    pub fn shared_marker(&self) -> &Path {
        &self.shared_marker
    }

    /// Maps a sandbox path to its host location.
    ///
    /// Uploads need the chat key, shared paths need the container key;
    /// an empty key counts as absent.
    pub fn to_host(
        &self,
        sandbox_path: &str,
        chat_key: Option<&str>,
        container_key: Option<&str>,
    ) -> Result<PathBuf, PathError> {
        let normalized = self.normalize(sandbox_path)?;
        let (class, remainder) = self
            .split(&normalized)
            .ok_or_else(|| PathError::UnknownPrefix(sandbox_path.to_string()))?;

        match class {
            PathClass::Uploads => {
                let chat_key = required_key(sandbox_path, chat_key, "chat key")?;
                if remainder.as_os_str().is_empty() {
                    return Err(PathError::NoFileName(sandbox_path.to_string()));
                }
                Ok(self.uploads_root.join(chat_key).join(remainder))
            }
            PathClass::Shared => {
                let container_key = required_key(sandbox_path, container_key, "container key")?;
                Ok(self.sandboxes_root.join(container_key).join(remainder))
            }
        }
    }

    /// Maps a filename or host path back into the sandbox uploads area.
    ///
    /// Only the basename survives: `/host/a/b/report.pdf` becomes
    /// `{uploads_marker}/report.pdf`. Callers that need another placement
    /// must build the sandbox path themselves.
    pub fn to_container(&self, name_or_host_path: impl AsRef<Path>) -> Result<String, PathError> {
        let path = name_or_host_path.as_ref();
        let basename = path
            .file_name()
            .ok_or_else(|| PathError::NoFileName(path.display().to_string()))?;
        Ok(self.uploads_marker.join(basename).display().to_string())
    }

    /// Maps a host path produced for this session back to where the
    /// session sees it.
    ///
    /// A path inside the chat's upload directory or the container's shared
    /// directory keeps its relative layout. Anything else falls back to
    /// [`to_container`](Self::to_container).
    pub fn to_sandbox(
        &self,
        host_path: &Path,
        chat_key: Option<&str>,
        container_key: Option<&str>,
    ) -> Result<String, PathError> {
        let areas = [
            (&self.uploads_root, chat_key, &self.uploads_marker),
            (&self.sandboxes_root, container_key, &self.shared_marker),
        ];
        for (root, key, marker) in areas {
            let Some(key) = key.filter(|k| !k.is_empty()) else {
                continue;
            };
            if let Ok(rest) = host_path.strip_prefix(root.join(key)) {
                if rest.components().all(|c| matches!(c, Component::Normal(_))) {
                    return Ok(marker.join(rest).display().to_string());
                }
            }
        }
        self.to_container(host_path)
    }

    /// Resolves `raw` against the sandbox root and folds `.` and `..`.
    fn normalize(&self, raw: &str) -> Result<PathBuf, PathError> {
        lexical_normalize(Path::new(raw), &self.sandbox_root)
            .ok_or_else(|| PathError::Traversal(raw.to_string()))
    }

    /// Longest marker wins, so nested markers classify correctly.
    fn split<'a>(&self, normalized: &'a Path) -> Option<(PathClass, &'a Path)> {
        let mut candidates = [
            (PathClass::Uploads, &self.uploads_marker),
            (PathClass::Shared, &self.shared_marker),
        ];
        candidates.sort_by_key(|(_, marker)| std::cmp::Reverse(marker.components().count()));

        candidates.into_iter().find_map(|(class, marker)| {
            normalized
                .strip_prefix(marker)
                .ok()
                .map(|remainder| (class, remainder))
        })
    }
}

/// Absolute, `..`-free form of `path`, or `None` if it climbs above `/`.
fn lexical_normalize(path: &Path, base: &Path) -> Option<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut resolved = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::Normal(segment) => resolved.push(segment),
        }
    }
    Some(resolved)
}

/// A session key becomes a single host directory name, so it must be one
/// plain segment.
fn required_key<'a>(
    path: &str,
    key: Option<&'a str>,
    context: &'static str,
) -> Result<&'a str, PathError> {
    let key = key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| PathError::MissingContext {
            path: path.to_string(),
            context,
        })?;

    let single_segment = matches!(
        Path::new(key).components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    );
    if !single_segment || key.contains(['/', '\\', '\0']) {
        return Err(PathError::InvalidContext {
            context,
            value: key.to_string(),
        });
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new(&BridgeConfig {
            uploads_root: PathBuf::from("/srv/uploads"),
            sandboxes_root: PathBuf::from("/srv/sandboxes"),
            ..BridgeConfig::default()
        })
    }

    // ── to_host: uploads ────────────────────────────────

    #[test]
    fn test_uploads_path_maps_to_chat_dir() {
        let host = translator()
            .to_host("/sandbox/uploads/report.pdf", Some("chatA"), None)
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/uploads/chatA/report.pdf"));
    }

    #[test]
    fn test_relative_path_resolved_against_sandbox_root() {
        let host = translator()
            .to_host("uploads/notes.txt", Some("chatA"), None)
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/uploads/chatA/notes.txt"));
    }

    #[test]
    fn test_dot_segments_are_folded() {
        let host = translator()
            .to_host("/sandbox/shared/../uploads/./a.txt", Some("chatA"), None)
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/uploads/chatA/a.txt"));
    }

    #[test]
    fn test_uploads_requires_chat_key() {
        let err = translator()
            .to_host("/sandbox/uploads/a.txt", None, Some("box1"))
            .unwrap_err();
        assert!(matches!(err, PathError::MissingContext { context: "chat key", .. }));

        let err = translator()
            .to_host("/sandbox/uploads/a.txt", Some(""), None)
            .unwrap_err();
        assert!(matches!(err, PathError::MissingContext { .. }));
    }

    #[test]
    fn test_uploads_marker_alone_has_no_filename() {
        let err = translator()
            .to_host("/sandbox/uploads", Some("chatA"), None)
            .unwrap_err();
        assert!(matches!(err, PathError::NoFileName(_)));
    }

    #[test]
    fn test_chat_key_cannot_escape_uploads_root() {
        for bad in ["..", "a/b", "../other", "."] {
            let err = translator()
                .to_host("/sandbox/uploads/a.txt", Some(bad), None)
                .unwrap_err();
            assert!(
                matches!(err, PathError::InvalidContext { .. }),
                "chat key {bad:?} should be rejected, got {err:?}"
            );
        }
    }

    // ── to_host: shared ─────────────────────────────────

    #[test]
    fn test_shared_path_maps_to_container_dir() {
        let host = translator()
            .to_host("/sandbox/shared/out/plot.png", Some("chatA"), Some("box1"))
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/sandboxes/box1/out/plot.png"));
    }

    #[test]
    fn test_shared_requires_container_key() {
        let err = translator()
            .to_host("/sandbox/shared/out/plot.png", Some("chatA"), None)
            .unwrap_err();
        assert!(matches!(err, PathError::MissingContext { context: "container key", .. }));
    }

    #[test]
    fn test_shared_marker_alone_maps_to_container_root() {
        let host = translator()
            .to_host("/sandbox/shared", None, Some("box1"))
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/sandboxes/box1"));
    }

    // ── to_host: rejection ──────────────────────────────

    #[test]
    fn test_unknown_prefix_rejected() {
        let err = translator()
            .to_host("/weird/prefix/x", Some("chatA"), None)
            .unwrap_err();
        assert_eq!(err, PathError::UnknownPrefix("/weird/prefix/x".to_string()));
    }

    #[test]
    fn test_marker_matches_whole_segments_only() {
        let err = translator()
            .to_host("/sandbox/uploadsX/a.txt", Some("chatA"), None)
            .unwrap_err();
        assert!(matches!(err, PathError::UnknownPrefix(_)));
    }

    #[test]
    fn test_traversal_out_of_uploads_is_not_an_upload() {
        let err = translator()
            .to_host("/sandbox/uploads/../../etc/passwd", Some("chatA"), None)
            .unwrap_err();
        assert!(matches!(err, PathError::UnknownPrefix(_)));
    }

    #[test]
    fn test_traversal_above_root_rejected() {
        let err = translator()
            .to_host("../../../../../../..", Some("chatA"), None)
            .unwrap_err();
        assert!(matches!(err, PathError::Traversal(_)));
    }

    // ── to_container ────────────────────────────────────

    #[test]
    fn test_to_container_from_filename() {
        assert_eq!(
            translator().to_container("report.pdf").unwrap(),
            "/sandbox/uploads/report.pdf"
        );
    }

    #[test]
    fn test_to_container_drops_directories() {
        assert_eq!(
            translator()
                .to_container("/srv/sandboxes/box1/out/plot.png")
                .unwrap(),
            "/sandbox/uploads/plot.png"
        );
    }

    #[test]
    fn test_to_container_without_filename() {
        assert!(matches!(
            translator().to_container("/"),
            Err(PathError::NoFileName(_))
        ));
    }

    #[test]
    fn test_round_trip_preserves_basename() {
        let t = translator();
        for name in ["a.txt", "with space.md", "nested/dir/deep.csv", "ünïcode.json"] {
            let sandbox = format!("/sandbox/uploads/{name}");
            let host = t.to_host(&sandbox, Some("chatA"), None).unwrap();
            let back = t.to_container(&host).unwrap();
            assert_eq!(
                Path::new(&back).file_name(),
                Path::new(name).file_name(),
                "basename lost for {name}"
            );
        }
    }

    // ── to_sandbox ──────────────────────────────────────

    #[test]
    fn test_to_sandbox_keeps_shared_layout() {
        let t = translator();
        let host = t
            .to_host("/sandbox/shared/out/plot.png", None, Some("box1"))
            .unwrap();
        assert_eq!(
            t.to_sandbox(&host, Some("chatA"), Some("box1")).unwrap(),
            "/sandbox/shared/out/plot.png"
        );
    }

    #[test]
    fn test_to_sandbox_keeps_upload_layout() {
        let t = translator();
        let host = PathBuf::from("/srv/uploads/chatA/sub/a.txt");
        assert_eq!(
            t.to_sandbox(&host, Some("chatA"), None).unwrap(),
            "/sandbox/uploads/sub/a.txt"
        );
    }

    #[test]
    fn test_to_sandbox_other_session_falls_back_to_basename() {
        let t = translator();
        let host = PathBuf::from("/srv/uploads/chatB/a.txt");
        assert_eq!(
            t.to_sandbox(&host, Some("chatA"), None).unwrap(),
            "/sandbox/uploads/a.txt"
        );
        assert_eq!(
            t.to_sandbox(Path::new("/var/tmp/x.bin"), None, None).unwrap(),
            "/sandbox/uploads/x.bin"
        );
    }

    // ── Classification / configuration ─────────────────

    #[test]
    fn test_leading_segment_decides_class() {
        let t = translator();
        assert!(t
            .to_host("/sandbox/uploads/a", Some("c"), Some("k"))
            .unwrap()
            .starts_with("/srv/uploads"));
        assert!(t
            .to_host("shared/b", Some("c"), Some("k"))
            .unwrap()
            .starts_with("/srv/sandboxes"));
        assert!(t.to_host("/tmp/c", Some("c"), Some("k")).is_err());
    }

    #[test]
    fn test_nested_markers_prefer_longest() {
        let t = PathTranslator::new(&BridgeConfig {
            sandbox_root: PathBuf::from("/mnt"),
            uploads_marker: PathBuf::from("/mnt/data/uploads"),
            shared_marker: PathBuf::from("/mnt/data"),
            uploads_root: PathBuf::from("/u"),
            sandboxes_root: PathBuf::from("/s"),
            ..BridgeConfig::default()
        });
        assert_eq!(
            t.to_host("/mnt/data/uploads/x", Some("c"), Some("k")).unwrap(),
            PathBuf::from("/u/c/x")
        );
        assert_eq!(
            t.to_host("/mnt/data/other/x", Some("c"), Some("k")).unwrap(),
            PathBuf::from("/s/k/other/x")
        );
    }

    #[test]
    fn test_relative_markers_resolved_against_root() {
        let t = PathTranslator::new(&BridgeConfig {
            sandbox_root: PathBuf::from("/work"),
            uploads_marker: PathBuf::from("in"),
            shared_marker: PathBuf::from("out"),
            ..BridgeConfig::default()
        });
        assert_eq!(t.uploads_marker(), Path::new("/work/in"));
        assert_eq!(t.shared_marker(), Path::new("/work/out"));
    }
}
