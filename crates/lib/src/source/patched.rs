//! The patch decorator: rewrites an inner source's content by applying
//! unified diffs on top of it.
//!
//! The decorated cache materializes the inner content into a working tree
//! under the destination directory, applies the patches there with the
//! external `patch` command, and re-tars the finished tree. The content key
//! covers both the inner key and the exact patch set, so changing either
//! invalidates everything downstream. A key marker persisted next to the
//! working tree lets an unchanged build skip the whole rebuild.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::exec::{self, ExecError};
use crate::hash;
use crate::hints::{Hints, LogHints};
use crate::source::{self, Cache, Source, SourceError};

/// Patch declaration as written in a recipe: a bare file path or a
/// `{ file, chdir }` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatchDecl {
    Path(String),
    Entry { file: String, chdir: Option<String> },
}

/// Normalized patch entry. Order within the patch list is significant and
/// part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub file: PathBuf,
    pub chdir: Option<String>,
}

impl From<PatchDecl> for Patch {
    fn from(decl: PatchDecl) -> Self {
        match decl {
            PatchDecl::Path(file) => Self {
                file: file.into(),
                chdir: None,
            },
            PatchDecl::Entry { file, chdir } => Self {
                file: file.into(),
                chdir,
            },
        }
    }
}

/// A source whose content is the inner source's content with patches
/// applied.
pub struct Patched {
    inner: Box<dyn Source>,
    patches: Vec<Patch>,
    hints: Arc<dyn Hints>,
}

impl Patched {
    /// Wrap `inner` when there is anything to apply. With an empty patch
    /// list the inner source is returned unchanged, with no wrapper and no
    /// overhead.
    pub fn decorate(
        patches: Vec<PatchDecl>,
        inner: Box<dyn Source>,
        hints: Arc<dyn Hints>,
    ) -> Box<dyn Source> {
        if patches.is_empty() {
            return inner;
        }
        let patches = patches.into_iter().map(Patch::from).collect();
        Box::new(Self {
            inner,
            patches,
            hints,
        })
    }

    pub fn new(inner: Box<dyn Source>, patches: Vec<Patch>) -> Self {
        Self {
            inner,
            patches,
            hints: Arc::new(LogHints),
        }
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }
}

impl Source for Patched {
    fn name(&self) -> &'static str {
        "patched"
    }

    fn build_cache(&self, tmpdir: &Path) -> Box<dyn Cache> {
        Box::new(PatchedCache {
            inner: self.inner.build_cache(tmpdir),
            patches: self.patches.clone(),
            workdir: tmpdir.join("patched"),
            hints: self.hints.clone(),
            key: None,
            updated: false,
            hinted: false,
        })
    }
}

struct PatchedCache {
    inner: Box<dyn Cache>,
    patches: Vec<Patch>,
    /// Working tree holding the patched content. Owned exclusively by this
    /// cache; concurrent builds must use distinct destination directories.
    workdir: PathBuf,
    hints: Arc<dyn Hints>,
    key: Option<String>,
    updated: bool,
    hinted: bool,
}

impl PatchedCache {
    /// Transient sibling used while rebuilding; never survives a completed
    /// operation.
    fn tmp_workdir(&self) -> PathBuf {
        sibling(&self.workdir, ".tmp")
    }

    /// Marker recording the key of the content currently in `workdir`.
    fn key_marker(&self) -> PathBuf {
        sibling(&self.workdir, ".cachekey")
    }

    fn compute_key(&mut self) -> Result<String, SourceError> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(self.inner.cachekey()?.as_bytes());
        buf.push(0);
        for patch in &self.patches {
            let content = fs::read(&patch.file).map_err(|source| SourceError::PatchUnreadable {
                patch: patch.file.clone(),
                source,
            })?;
            buf.extend_from_slice(&content);
            buf.push(0);
        }
        let key = hash::hash_bytes(&buf);
        self.key = Some(key.clone());
        Ok(key)
    }

    /// The redundant-chdir advisory is a static configuration observation:
    /// it fires once per build attempt whether or not a rebuild happens.
    fn emit_hints(&mut self) -> Result<(), SourceError> {
        if self.hinted {
            return Ok(());
        }
        self.hinted = true;
        let Some(prefix) = self.inner.prefix()?.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        for patch in &self.patches {
            if patch.chdir.as_deref() == Some(prefix.as_str()) {
                self.hints.hint(
                    &format!(
                        "You can remove the chdir: {:?} already is the source prefix",
                        prefix
                    ),
                    "docs/patching.md#chdir",
                );
            }
        }
        Ok(())
    }

    fn update(&mut self) -> Result<(), SourceError> {
        if self.updated {
            return Ok(());
        }
        let key = self.compute_key()?;
        self.emit_hints()?;
        let recorded = fs::read_to_string(self.key_marker()).ok();
        if recorded.as_deref() == Some(key.as_str()) && self.workdir.is_dir() {
            debug!(key = %key, workdir = %self.workdir.display(), "patched tree is current");
            self.updated = true;
            return Ok(());
        }
        self.rebuild(&key)?;
        self.updated = true;
        Ok(())
    }

    fn rebuild(&mut self, key: &str) -> Result<(), SourceError> {
        let tmp = self.tmp_workdir();
        // Leftovers of an earlier failed or cancelled attempt must never
        // leak into this build.
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;
        self.inner.copy_to(&tmp)?;

        let inferred = self.inner.prefix()?.filter(|p| !p.is_empty());
        for patch in &self.patches {
            apply(patch, &tmp, inferred.as_deref())?;
        }

        if self.workdir.exists() {
            fs::remove_dir_all(&self.workdir)?;
        }
        fs::rename(&tmp, &self.workdir)?;
        fs::write(self.key_marker(), key)?;
        info!(key = %key, patches = self.patches.len(), "patched tree rebuilt");
        Ok(())
    }
}

/// Apply one patch inside the working tree. The working subdirectory is the
/// patch's explicit `chdir` when given, else the inner cache's prefix.
fn apply(patch: &Patch, root: &Path, inferred: Option<&str>) -> Result<(), SourceError> {
    let chdir = patch.chdir.as_deref().or(inferred);
    let dir = match chdir {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };
    let file = patch
        .file
        .canonicalize()
        .map_err(|source| SourceError::PatchUnreadable {
            patch: patch.file.clone(),
            source,
        })?;
    debug!(patch = %file.display(), dir = %dir.display(), "applying patch");
    match exec::run(
        "patch",
        [
            OsStr::new("-p1"),
            OsStr::new("--batch"),
            OsStr::new("--input"),
            file.as_os_str(),
        ],
        Some(&dir),
    ) {
        Ok(_) => Ok(()),
        Err(ExecError::Failed {
            command,
            status,
            stderr,
        }) => Err(SourceError::PatchFailed {
            patch: patch.file.clone(),
            status,
            stderr,
            command,
        }),
        Err(err) => Err(err.into()),
    }
}

impl Cache for PatchedCache {
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
        self.update()?;
        source::tar_dir(&self.workdir)
    }

    fn cachekey(&mut self) -> Result<String, SourceError> {
        self.compute_key()
    }

    /// The finished working tree is copied as-is; patches are already
    /// applied.
    fn copy_to(&mut self, dst: &Path) -> Result<(), SourceError> {
        self.update()?;
        source::copy_children(&self.workdir, dst)
    }

    /// Patching does not move where the real content lives inside the
    /// archive layout.
    fn prefix(&mut self) -> Result<Option<String>, SourceError> {
        self.inner.prefix()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::null::Null;
    use crate::tarstream;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    const PATCH_OLLA: &str = "\
--- a/World
+++ b/World
@@ -1 +1 @@
-Hello
+Olla
";

    const PATCH_CIAO: &str = "\
--- a/World
+++ b/World
@@ -1 +1 @@
-Hello
+Ciao
";

    #[derive(Default)]
    struct RecordingHints(Mutex<Vec<String>>);

    impl Hints for RecordingHints {
        fn hint(&self, message: &str, _documentation: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    /// In-memory stand-in for an inner source.
    #[derive(Clone)]
    struct MemSource {
        entries: Vec<(&'static str, &'static str)>,
        prefix: Option<&'static str>,
        key: &'static str,
    }

    impl MemSource {
        fn hello() -> Self {
            Self {
                entries: vec![("World", "Hello\n")],
                prefix: None,
                key: "mem-key",
            }
        }

        fn with_prefix() -> Self {
            Self {
                entries: vec![("World", "Hello\n"), ("foo/World", "Hello\n")],
                prefix: Some("foo"),
                key: "mem-key",
            }
        }
    }

    impl Source for MemSource {
        fn name(&self) -> &'static str {
            "mem"
        }

        fn build_cache(&self, _tmpdir: &Path) -> Box<dyn Cache> {
            Box::new(MemCache {
                source: self.clone(),
            })
        }
    }

    struct MemCache {
        source: MemSource,
    }

    impl Cache for MemCache {
        fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
            let files: Vec<tarstream::ArchiveFile> = self
                .source
                .entries
                .iter()
                .map(|&(name, content)| tarstream::ArchiveFile {
                    name,
                    mode: 0o644,
                    content: content.as_bytes(),
                })
                .collect();
            Ok(Box::new(Cursor::new(tarstream::file_archive(&files)?)))
        }

        fn cachekey(&mut self) -> Result<String, SourceError> {
            Ok(self.source.key.to_string())
        }

        fn prefix(&mut self) -> Result<Option<String>, SourceError> {
            Ok(self.source.prefix.map(str::to_string))
        }
    }

    /// Inner cache with a direct filesystem path; streaming it is a bug.
    struct CopyOnly;

    impl Source for CopyOnly {
        fn name(&self) -> &'static str {
            "copy-only"
        }

        fn build_cache(&self, _tmpdir: &Path) -> Box<dyn Cache> {
            Box::new(CopyOnlyCache)
        }
    }

    struct CopyOnlyCache;

    impl Cache for CopyOnlyCache {
        fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
            panic!("copy_to must be preferred over the archive round-trip");
        }

        fn cachekey(&mut self) -> Result<String, SourceError> {
            Ok("copy-only".to_string())
        }

        fn copy_to(&mut self, dst: &Path) -> Result<(), SourceError> {
            fs::write(dst.join("World"), "Hello\n")?;
            Ok(())
        }
    }

    fn write_patch(dir: &Path, name: &str, content: &str) -> PatchDecl {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        PatchDecl::Path(path.to_string_lossy().into_owned())
    }

    fn read_files(cache: &mut dyn Cache) -> BTreeMap<String, String> {
        tarstream::entries(cache.tar_io().unwrap())
            .unwrap()
            .into_iter()
            .map(|(name, content)| (name, String::from_utf8_lossy(&content).into_owned()))
            .collect()
    }

    fn decorated(
        source: impl Source + 'static,
        patches: Vec<PatchDecl>,
        hints: Arc<dyn Hints>,
    ) -> Box<dyn Source> {
        Patched::decorate(patches, Box::new(source), hints)
    }

    #[test]
    fn zero_patches_returns_the_inner_source() {
        let src = decorated(MemSource::hello(), vec![], Arc::new(LogHints));
        assert_eq!(src.name(), "mem");
    }

    #[test]
    fn nonempty_patch_list_decorates() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
        assert_eq!(src.name(), "patched");
        // Bare paths normalize to entries without a chdir.
        // (`Patched::patches` is only reachable on the concrete type.)
    }

    #[test]
    fn applies_patches() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files.len(), 1);
        assert_eq!(files["./World"], "Olla\n");
    }

    #[test]
    fn untouched_entries_survive_a_top_level_patch() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let inner = MemSource {
            entries: vec![("World", "Hello\n"), ("foo/World", "Hello\n")],
            prefix: None,
            key: "mem-key",
        };
        let src = decorated(inner, vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files.len(), 2);
        assert_eq!(files["./World"], "Olla\n");
        assert_eq!(files["./foo/World"], "Hello\n");
    }

    #[test]
    fn applies_patches_with_explicit_chdir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patch.diff");
        fs::write(&path, PATCH_OLLA).unwrap();
        let src = decorated(
            MemSource::with_prefix(),
            vec![PatchDecl::Entry {
                file: path.to_string_lossy().into_owned(),
                chdir: Some("foo".to_string()),
            }],
            Arc::new(LogHints),
        );
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files["./World"], "Hello\n");
        assert_eq!(files["./foo/World"], "Olla\n");
    }

    #[test]
    fn inner_prefix_is_used_as_chdir() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::with_prefix(), vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files["./World"], "Hello\n");
        assert_eq!(files["./foo/World"], "Olla\n");
    }

    #[test]
    fn redundant_chdir_is_hinted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patch.diff");
        fs::write(&path, PATCH_OLLA).unwrap();
        let hints = Arc::new(RecordingHints::default());
        let src = decorated(
            MemSource::with_prefix(),
            vec![PatchDecl::Entry {
                file: path.to_string_lossy().into_owned(),
                chdir: Some("foo".to_string()),
            }],
            hints.clone(),
        );
        let mut cache = src.build_cache(tmp.path());
        cache.tar_io().unwrap();
        let messages = hints.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("You can remove the chdir"));
    }

    #[test]
    fn redundant_chdir_is_hinted_even_when_the_cache_is_current() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patch.diff");
        fs::write(&path, PATCH_OLLA).unwrap();
        let decl = PatchDecl::Entry {
            file: path.to_string_lossy().into_owned(),
            chdir: Some("foo".to_string()),
        };

        // First build materializes the tree.
        let src = decorated(MemSource::with_prefix(), vec![decl.clone()], Arc::new(LogHints));
        src.build_cache(tmp.path()).tar_io().unwrap();

        // Second build short-circuits on the key marker but still hints.
        let hints = Arc::new(RecordingHints::default());
        let src = decorated(MemSource::with_prefix(), vec![decl], hints.clone());
        let canary = tmp.path().join("patched.tmp");
        src.build_cache(tmp.path()).tar_io().unwrap();
        assert_eq!(hints.0.lock().unwrap().len(), 1);
        // No rebuild happened.
        assert!(!canary.exists());
    }

    #[test]
    fn cachekey_covers_inner_key_and_patch_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());

        let mut expected = Vec::new();
        expected.extend_from_slice(b"mem-key");
        expected.push(0);
        expected.extend_from_slice(PATCH_OLLA.as_bytes());
        expected.push(0);
        assert_eq!(cache.cachekey().unwrap(), hash::hash_bytes(&expected));
    }

    #[test]
    fn cachekey_changes_with_the_patch_set() {
        let tmp = tempfile::tempdir().unwrap();
        let olla = write_patch(tmp.path(), "olla.diff", PATCH_OLLA);
        let ciao = write_patch(tmp.path(), "ciao.diff", PATCH_CIAO);

        let key = |patches: Vec<PatchDecl>| {
            decorated(MemSource::hello(), patches, Arc::new(LogHints))
                .build_cache(tmp.path())
                .cachekey()
                .unwrap()
        };
        let olla_key = key(vec![olla.clone()]);
        assert_eq!(olla_key, key(vec![olla.clone()]));
        assert_ne!(olla_key, key(vec![ciao.clone()]));
        assert_ne!(key(vec![olla.clone(), ciao.clone()]), key(vec![ciao, olla]));
    }

    #[test]
    fn switching_patch_sets_does_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let olla = write_patch(tmp.path(), "olla.diff", PATCH_OLLA);
        let ciao = write_patch(tmp.path(), "ciao.diff", PATCH_CIAO);

        let content = |patch: PatchDecl| {
            let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
            let mut cache = src.build_cache(tmp.path());
            read_files(cache.as_mut())["./World"].clone()
        };
        assert_eq!(content(olla.clone()), "Olla\n");
        assert_eq!(content(ciao), "Ciao\n");
        assert_eq!(content(olla), "Olla\n");
    }

    #[test]
    fn stale_tmp_workdir_is_removed_before_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let stale = tmp.path().join("patched.tmp");
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("canary"), "left behind").unwrap();

        let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files["./World"], "Olla\n");
        assert!(!tmp.path().join("patched/canary").exists());
        assert!(!stale.exists());
    }

    #[test]
    fn failing_patch_is_fatal_and_structured() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(Null, vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let err = match cache.tar_io() {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        match err {
            SourceError::PatchFailed {
                patch,
                status,
                command,
                ..
            } => {
                assert!(patch.ends_with("patch.diff"));
                assert_ne!(status, 0);
                assert!(command.starts_with("patch"));
            }
            other => panic!("expected PatchFailed, got {other:?}"),
        }
    }

    #[test]
    fn inner_copy_fast_path_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(CopyOnly, vec![patch], Arc::new(LogHints));
        let mut cache = src.build_cache(tmp.path());
        let files = read_files(cache.as_mut());
        assert_eq!(files["./World"], "Olla\n");
    }

    #[test]
    fn copy_to_ships_the_patched_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::hello(), vec![patch], Arc::new(LogHints));
        src.build_cache(tmp.path()).copy_to(target.path()).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("World")).unwrap(),
            "Olla\n"
        );
    }

    #[test]
    fn prefix_is_forwarded_from_the_inner_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = write_patch(tmp.path(), "patch.diff", PATCH_OLLA);
        let src = decorated(MemSource::with_prefix(), vec![patch], Arc::new(LogHints));
        assert_eq!(
            src.build_cache(tmp.path()).prefix().unwrap().as_deref(),
            Some("foo")
        );
    }

    #[test]
    fn bare_paths_normalize_to_patch_entries() {
        let patched = Patched::new(
            Box::new(MemSource::hello()),
            vec![
                Patch::from(PatchDecl::Path("a.diff".to_string())),
                Patch::from(PatchDecl::Entry {
                    file: "b.diff".to_string(),
                    chdir: Some("sub".to_string()),
                }),
            ],
        );
        assert_eq!(patched.patches()[0].file, PathBuf::from("a.diff"));
        assert_eq!(patched.patches()[0].chdir, None);
        assert_eq!(patched.patches()[1].chdir.as_deref(), Some("sub"));
    }
}
