//! Source resolution: where build content comes from.
//!
//! A [`Source`] is an immutable descriptor of a content location: a local
//! directory, a git repository, a remote archive. Binding it to a
//! destination directory yields a [`Cache`]: a materializable view that can
//! stream the content as a tar archive, report a content key for reuse
//! detection, and optionally copy itself straight onto the filesystem.
//!
//! Kinds register in a [`SourceTypes`] registry; [`SourceTypes::guess`]
//! picks the kind that claims a location most specifically, and refuses to
//! pick at all when the claim is ambiguous.

pub mod archive;
pub mod dir;
pub mod git;
pub mod null;
pub mod patched;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::exec::{self, ExecError};
use crate::tarstream;

pub use patched::{Patch, PatchDecl, Patched};

/// Errors from source resolution and cache materialization.
#[derive(Debug, Error)]
pub enum SourceError {
    /// An explicit type override named a kind that is not registered.
    #[error("unknown source type `{kind}`; valid types are: {}", .valid.join(", "))]
    UnknownType { kind: String, valid: Vec<String> },

    /// No registered kind claims the location.
    #[error(
        "no source type found for `{url}`; set one explicitly with `with`; valid types are: {}",
        .valid.join(", ")
    )]
    NoSourceFound { url: String, valid: Vec<String> },

    /// Two or more kinds claim the location equally strongly.
    #[error(
        "multiple source types claim `{url}`: {}; disambiguate with `with`",
        .kinds.join(", ")
    )]
    Ambiguous { url: String, kinds: Vec<String> },

    /// External patch application exited non-zero.
    #[error("patch {} failed with status {status}: {stderr}", .patch.display())]
    PatchFailed {
        patch: PathBuf,
        status: i32,
        stderr: String,
        command: String,
    },

    /// A declared patch file could not be read.
    #[error("cannot read patch {}: {source}", .patch.display())]
    PatchUnreadable {
        patch: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A downloaded archive did not match its declared checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// The archive extension maps to no known decoder.
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    /// Downloading a remote archive failed.
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable descriptor of a content location.
pub trait Source {
    /// Kind tag, e.g. `"dir"` or `"patched"`.
    fn name(&self) -> &'static str;

    /// Bind this source to a destination directory used for staging.
    fn build_cache(&self, tmpdir: &Path) -> Box<dyn Cache>;
}

/// A resolved, materializable view of a [`Source`] for one build.
///
/// A cache may persist staging state under its destination directory across
/// calls, but two caches built from equal sources against equivalent
/// destinations yield identical archive streams and content keys. One cache
/// object serves one build; concurrent builds use distinct destinations.
pub trait Cache {
    /// Live tar stream over the source contents.
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError>;

    /// Content key over the resolved contents, lazily computed.
    fn cachekey(&mut self) -> Result<String, SourceError>;

    /// Materialize the contents into `dst`.
    ///
    /// The default goes through the archive stream; kinds with a direct
    /// filesystem path override it.
    fn copy_to(&mut self, dst: &Path) -> Result<(), SourceError> {
        let io = self.tar_io()?;
        tarstream::unpack(io, dst)?;
        Ok(())
    }

    /// Subdirectory inside the archive that holds the real content, if any.
    fn prefix(&mut self) -> Result<Option<String>, SourceError> {
        Ok(None)
    }
}

/// Kind-specific options attached to a source declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceOptions {
    /// Explicit source type override.
    pub with: Option<String>,

    /// Revision for version-control sources.
    pub rev: Option<String>,

    /// Expected SHA-256 of a downloaded archive.
    pub sha256: Option<String>,

    /// Unified diffs applied on top of the source content, in order.
    #[serde(default)]
    pub patches: Vec<PatchDecl>,
}

/// Factory capability for one source kind.
pub trait SourceType {
    /// Kind name used in listings and error messages.
    fn name(&self) -> &'static str;

    /// How strongly this kind claims `url`.
    ///
    /// `None` never claims. Scores are the length of the matched portion of
    /// the location, so a whole-URL match (a `.git` suffix) outranks a
    /// scheme-only match.
    fn score(&self, _url: &str) -> Option<usize> {
        None
    }

    /// Construct a source for the location.
    fn build(&self, url: &str, options: &SourceOptions) -> Result<Box<dyn Source>, SourceError>;
}

/// Registry of source kinds consulted when resolving a location.
pub struct SourceTypes {
    types: BTreeMap<String, Arc<dyn SourceType + Send + Sync>>,
}

impl SourceTypes {
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// The built-in kinds: `git`, `http`/`tar` (one factory, two names) and
    /// `dir`.
    pub fn with_defaults() -> Self {
        let mut types = Self::new();
        let remote: Arc<dyn SourceType + Send + Sync> = Arc::new(archive::ArchiveType);
        types.register("git", Arc::new(git::GitType));
        types.register("http", remote.clone());
        types.register("tar", remote);
        types.register("dir", Arc::new(dir::DirType));
        types
    }

    /// Register a kind. Registering the same factory under several names is
    /// fine; the guesser de-duplicates by identity.
    pub fn register(&mut self, kind: &str, ty: Arc<dyn SourceType + Send + Sync>) {
        self.types.insert(kind.to_string(), ty);
    }

    /// Registered kind names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// Pick the source type for a location.
    ///
    /// With an explicit override the lookup is direct. Otherwise every
    /// distinct factory scores the location; the best score wins, no claim
    /// at all is [`SourceError::NoSourceFound`], and a tie is a hard
    /// [`SourceError::Ambiguous`], never a silent first-match pick.
    pub fn guess(
        &self,
        url: &str,
        with: Option<&str>,
    ) -> Result<Arc<dyn SourceType + Send + Sync>, SourceError> {
        if let Some(kind) = with {
            return self
                .types
                .get(kind)
                .cloned()
                .ok_or_else(|| SourceError::UnknownType {
                    kind: kind.to_string(),
                    valid: self.names(),
                });
        }

        let mut distinct: Vec<&Arc<dyn SourceType + Send + Sync>> = Vec::new();
        for ty in self.types.values() {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, ty)) {
                distinct.push(ty);
            }
        }

        let mut best: Option<usize> = None;
        let mut winners: Vec<&Arc<dyn SourceType + Send + Sync>> = Vec::new();
        for ty in distinct {
            let Some(score) = ty.score(url) else { continue };
            match best {
                Some(current) if score < current => {}
                Some(current) if score == current => winners.push(ty),
                _ => {
                    best = Some(score);
                    winners = vec![ty];
                }
            }
        }

        match winners.as_slice() {
            [] => Err(SourceError::NoSourceFound {
                url: url.to_string(),
                valid: self.names(),
            }),
            [winner] => Ok(Arc::clone(winner)),
            many => Err(SourceError::Ambiguous {
                url: url.to_string(),
                kinds: many.iter().map(|ty| ty.name().to_string()).collect(),
            }),
        }
    }
}

impl Default for SourceTypes {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorted non-dotfile top-level child names of a directory.
pub(crate) fn visible_children(dir: &Path) -> Result<Vec<OsString>, std::io::Error> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        children.push(name);
    }
    children.sort();
    Ok(children)
}

/// Stream a directory as a tar archive via the external archiver, with the
/// working directory set to `dir` so entry names come out as `./…`.
/// Top-level dotfiles are excluded; an empty directory yields an empty
/// archive.
pub(crate) fn tar_dir(dir: &Path) -> Result<Box<dyn Read + Send>, SourceError> {
    let children = visible_children(dir)?;
    if children.is_empty() {
        return Ok(Box::new(std::io::Cursor::new(
            tarstream::EMPTY_ARCHIVE.to_vec(),
        )));
    }
    let mut args: Vec<OsString> = vec!["-cf".into(), "-".into()];
    args.extend(children.into_iter().map(|name| {
        let mut member = OsString::from("./");
        member.push(name);
        member
    }));
    let stream = exec::popen("tar", args, Some(dir))?;
    Ok(Box::new(stream))
}

/// Copy the non-dotfile top-level children of `src` into `dst` with the
/// external copy utility.
pub(crate) fn copy_children(src: &Path, dst: &Path) -> Result<(), SourceError> {
    let children = visible_children(src)?;
    if children.is_empty() {
        return Ok(());
    }
    let mut args: Vec<OsString> = vec!["-R".into()];
    args.extend(children.into_iter().map(|name| src.join(name).into_os_string()));
    args.push(dst.as_os_str().to_os_string());
    exec::run("cp", args, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScore {
        name: &'static str,
        score: Option<usize>,
    }

    impl SourceType for FixedScore {
        fn name(&self) -> &'static str {
            self.name
        }

        fn score(&self, _url: &str) -> Option<usize> {
            self.score
        }

        fn build(&self, _url: &str, _options: &SourceOptions) -> Result<Box<dyn Source>, SourceError> {
            Ok(Box::new(null::Null))
        }
    }

    fn kind_for(url: &str) -> &'static str {
        SourceTypes::with_defaults()
            .guess(url, None)
            .map(|ty| ty.name())
            .unwrap()
    }

    #[test]
    fn guesses_expected_kinds() {
        assert_eq!(kind_for("/opt/src"), "dir");
        assert_eq!(kind_for("./relative"), "dir");
        assert_eq!(kind_for("../relative"), "dir");
        assert_eq!(kind_for("file:///opt/src"), "dir");
        assert_eq!(kind_for("https://example.com/repo.git"), "git");
        assert_eq!(kind_for("user@example.com:repo.git"), "git");
        assert_eq!(kind_for("git://example.com/repo"), "git");
        assert_eq!(kind_for("http://example.com/pkg-1.0.tar.gz"), "archive");
        assert_eq!(kind_for("https://example.com/pkg-1.0.tar.bz2"), "archive");
    }

    #[test]
    fn unclaimed_location_is_an_error() {
        let err = match SourceTypes::with_defaults().guess("ftp://example.com/pkg.tar.gz", None) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        match err {
            SourceError::NoSourceFound { url, valid } => {
                assert_eq!(url, "ftp://example.com/pkg.tar.gz");
                assert_eq!(valid, vec!["dir", "git", "http", "tar"]);
            }
            other => panic!("expected NoSourceFound, got {other:?}"),
        }
    }

    #[test]
    fn explicit_override_skips_scoring() {
        let types = SourceTypes::with_defaults();
        // A URL that no kind claims still resolves when a kind is named.
        let ty = types.guess("ftp://example.com/pkg.tar.gz", Some("tar")).unwrap();
        assert_eq!(ty.name(), "archive");
    }

    #[test]
    fn unknown_override_is_an_error() {
        let err = match SourceTypes::with_defaults().guess("/opt/src", Some("svn")) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, SourceError::UnknownType { kind, .. } if kind == "svn"));
    }

    #[test]
    fn tied_scores_are_a_hard_error() {
        let mut types = SourceTypes::with_defaults();
        types.register(
            "localdir",
            Arc::new(FixedScore {
                name: "localdir",
                score: Some(1),
            }),
        );
        let err = match types.guess("/opt/src", None) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        match err {
            SourceError::Ambiguous { kinds, .. } => {
                assert!(kinds.contains(&"dir".to_string()));
                assert!(kinds.contains(&"localdir".to_string()));
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn aliases_of_one_factory_do_not_tie_with_themselves() {
        // `http` and `tar` share a factory; a plain https URL must resolve
        // instead of tying with its own alias.
        let ty = SourceTypes::with_defaults()
            .guess("https://example.com/pkg-1.0.tar.gz", None)
            .unwrap();
        assert_eq!(ty.name(), "archive");
    }

    #[test]
    fn higher_score_wins() {
        // A `.git` suffix matches the whole URL and outranks the scheme
        // match of the remote-archive kind.
        assert_eq!(kind_for("https://example.com/project.git"), "git");
    }

    #[test]
    fn never_scoring_kind_loses_to_any_claim() {
        let mut types = SourceTypes::with_defaults();
        types.register(
            "mute",
            Arc::new(FixedScore {
                name: "mute",
                score: None,
            }),
        );
        assert_eq!(types.guess("/opt/src", None).unwrap().name(), "dir");
    }
}
