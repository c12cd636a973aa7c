//! Staging of submitted scripts and resolution of caller data mounts.

use crate::error::{RelayError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maps a caller identity to its upload directory.
///
/// The relay only reads the returned path; the directory is owned by
/// whatever stores uploads.
pub trait UploadStore: Send + Sync {
    fn resolve(&self, identity: &str) -> Option<PathBuf>;
}

/// Upload store laid out as `<root>/<identity>/`.
#[derive(Debug, Clone)]
pub struct DirUploadStore {
    root: PathBuf,
}

impl DirUploadStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }
}

impl UploadStore for DirUploadStore {
    fn resolve(&self, identity: &str) -> Option<PathBuf> {
        if !is_plain_component(identity) {
            debug!(identity, "identity is not a plain path component");
            return None;
        }
        let dir = fs::canonicalize(self.root.join(identity)).ok()?;
        // A symlink inside the store must not lead out of it.
        if !dir.starts_with(&self.root) || !dir.is_dir() {
            return None;
        }
        Some(dir)
    }
}

fn is_plain_component(identity: &str) -> bool {
    if identity.is_empty() || identity.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(identity).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Prefix of per-instance scratch subdirectories: `relay-<pid>-<id>`.
const INSTANCE_PREFIX: &str = "relay-";

/// Owns this instance's scratch subdirectory, which holds one file per
/// execution.
///
/// Several relays may share a scratch root. Each writes only below its own
/// subdirectory, and only subdirectories whose owning process is gone are
/// swept.
pub struct Stager {
    root: PathBuf,
    dir: PathBuf,
    extension: String,
    uploads: Option<Arc<dyn UploadStore>>,
}

impl Stager {
    /// Prepare a fresh subdirectory of `root` for staging: create it, make
    /// sure it is writable and remove what dead relays left behind.
    pub fn open(root: impl AsRef<Path>, extension: &str) -> Result<Self> {
        let root = root.as_ref();
        let scratch_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RelayError::Scratch { path, source }
        };

        fs::create_dir_all(root).map_err(scratch_err(root))?;
        let root = fs::canonicalize(root).map_err(scratch_err(root))?;

        let removed = sweep_dead_instances(&root);
        if removed > 0 {
            info!(removed, root = ?root, "Removed scratch directories of exited relays");
        }

        let dir = root.join(format!(
            "{}{}-{}",
            INSTANCE_PREFIX,
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        fs::create_dir(&dir).map_err(scratch_err(dir.as_path()))?;

        let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"").map_err(scratch_err(dir.as_path()))?;
        let _ = fs::remove_file(&probe);

        debug!(dir = ?dir, "Scratch directory ready");
        Ok(Self {
            root,
            dir,
            extension: extension.trim_start_matches('.').to_string(),
            uploads: None,
        })
    }

    /// Attach the store used to resolve data mounts. Without one, sandboxes
    /// never get a data mount.
    pub fn with_upload_store(mut self, uploads: Arc<dyn UploadStore>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// This instance's own subdirectory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a session's script is staged at.
    pub fn script_path(&self, session: Uuid) -> PathBuf {
        self.dir.join(format!("{}.{}", session, self.extension))
    }

    /// Write `code` to a fresh file named after the session.
    pub async fn stage(&self, session: Uuid, code: &str) -> Result<PathBuf> {
        let path = self.script_path(session);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
            .await
            .map_err(RelayError::Staging)?;

        let written = async {
            file.write_all(code.as_bytes()).await?;
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            unstage(&path).await;
            return Err(RelayError::Staging(e));
        }
        debug!(session = %session, path = ?path, bytes = code.len(), "Staged script");
        Ok(path)
    }

    /// Look up the caller's upload directory; absence is not an error.
    pub async fn resolve_mount(&self, identity: Option<&str>) -> Option<PathBuf> {
        let uploads = self.uploads.clone()?;
        let identity = identity?.to_string();
        tokio::task::spawn_blocking(move || uploads.resolve(&identity))
            .await
            .ok()
            .flatten()
    }
}

impl Drop for Stager {
    fn drop(&mut self) {
        // Only succeeds once every script is gone.
        if fs::remove_dir(&self.dir).is_ok() {
            debug!(dir = ?self.dir, "Removed scratch directory");
        }
    }
}

/// Owning pid of an instance subdirectory name.
fn instance_owner(name: &str) -> Option<i32> {
    let rest = name.strip_prefix(INSTANCE_PREFIX)?;
    let (pid, id) = rest.split_once('-')?;
    Uuid::parse_str(id).ok()?;
    pid.parse().ok()
}

fn process_alive(pid: i32) -> bool {
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Remove the subdirectories of relays that are no longer running.
fn sweep_dead_instances(root: &Path) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let me = std::process::id() as i32;
    let mut removed = 0;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(instance_owner) else {
            continue;
        };
        if pid == me || pid <= 1 || process_alive(pid) {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(
                path = ?entry.path(),
                "Failed to remove stale scratch directory: {}", e
            ),
        }
    }
    removed
}

/// Remove a staged script. A file that is already gone counts as removed.
pub async fn unstage(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "Unstaged script"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, "Failed to remove staged script: {}", e),
    }
}

/// Blocking variant of [`unstage`] for drop paths.
pub fn unstage_blocking(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, "Failed to remove staged script: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn count_files(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn stage_and_unstage() {
        let tmp = TempDir::new().unwrap();
        let stager = Stager::open(tmp.path().join("scratch"), "py").unwrap();
        let id = Uuid::new_v4();

        let path = stager.stage(id, "print('hi')").await.unwrap();
        assert_eq!(path, stager.script_path(id));
        assert_eq!(fs::read_to_string(&path).unwrap(), "print('hi')");
        assert!(path.to_string_lossy().ends_with(".py"));

        unstage(&path).await;
        assert!(!path.exists());
        // Second removal is a no-op.
        unstage(&path).await;
        unstage_blocking(&path);
        assert_eq!(count_files(stager.dir()), 0);
    }

    #[tokio::test]
    async fn staging_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let stager = Stager::open(tmp.path(), ".py").unwrap();
        let id = Uuid::new_v4();
        stager.stage(id, "first").await.unwrap();

        let err = stager.stage(id, "second").await.unwrap_err();
        assert!(matches!(err, RelayError::Staging(_)));
        assert_eq!(fs::read_to_string(stager.script_path(id)).unwrap(), "first");
    }

    #[test]
    fn open_sweeps_only_dead_instances() {
        let tmp = TempDir::new().unwrap();
        // pid 0x7fffffff is above any pid_max, so its owner is gone.
        let dead = tmp
            .path()
            .join(format!("relay-2147483647-{}", Uuid::new_v4().simple()));
        let unrelated = tmp.path().join("notes");
        let loose = tmp.path().join(format!("{}.py", Uuid::new_v4()));
        fs::create_dir(&dead).unwrap();
        fs::write(dead.join(format!("{}.py", Uuid::new_v4())), "x").unwrap();
        fs::create_dir(&unrelated).unwrap();
        fs::write(&loose, "x").unwrap();

        let stager = Stager::open(tmp.path(), "py").unwrap();
        assert!(!dead.exists());
        assert!(unrelated.exists());
        assert!(loose.exists());
        assert_eq!(stager.root(), tmp.path().canonicalize().unwrap());
        assert_eq!(stager.dir().parent(), Some(stager.root()));
    }

    #[tokio::test]
    async fn instances_sharing_a_root_keep_their_scripts() {
        let tmp = TempDir::new().unwrap();
        let first = Stager::open(tmp.path(), "py").unwrap();
        let id = Uuid::new_v4();
        let live = first.stage(id, "print('still mine')").await.unwrap();

        let second = Stager::open(tmp.path(), "py").unwrap();
        assert_ne!(first.dir(), second.dir());
        assert!(live.exists());
        assert_eq!(fs::read_to_string(&live).unwrap(), "print('still mine')");
    }

    #[test]
    fn dropping_an_idle_stager_removes_its_directory() {
        let tmp = TempDir::new().unwrap();
        let stager = Stager::open(tmp.path(), "py").unwrap();
        let dir = stager.dir().to_path_buf();
        assert!(dir.is_dir());
        drop(stager);
        assert!(!dir.exists());
    }

    #[test]
    fn instance_names_carry_their_owner() {
        let id = Uuid::new_v4().simple().to_string();
        assert_eq!(instance_owner(&format!("relay-42-{id}")), Some(42));
        assert_eq!(instance_owner("relay-42-notauuid"), None);
        assert_eq!(instance_owner(&format!("other-42-{id}")), None);
        assert_eq!(instance_owner(&format!("relay-x-{id}")), None);
    }

    #[test]
    fn open_fails_when_scratch_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, "x").unwrap();
        let err = Stager::open(&file, "py").err().unwrap();
        assert!(matches!(err, RelayError::Scratch { .. }));
    }

    #[test]
    fn upload_store_resolves_existing_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("alice")).unwrap();
        fs::write(tmp.path().join("bob"), "not a dir").unwrap();
        let store = DirUploadStore::open(tmp.path()).unwrap();

        let alice = store.resolve("alice").unwrap();
        assert!(alice.is_absolute());
        assert!(alice.ends_with("alice"));
        assert_eq!(store.resolve("bob"), None);
        assert_eq!(store.resolve("carol"), None);
    }

    #[test]
    fn upload_store_rejects_escaping_identities() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("uploads");
        fs::create_dir_all(root.join("alice")).unwrap();
        fs::create_dir(tmp.path().join("secret")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("secret"), root.join("sneaky")).unwrap();
        let store = DirUploadStore::open(&root).unwrap();

        for identity in ["", ".", "..", "../secret", "alice/..", "/etc", "a\\b", "sneaky"] {
            assert_eq!(store.resolve(identity), None, "{identity:?}");
        }
    }

    #[tokio::test]
    async fn mounts_need_a_store_and_an_identity() {
        let tmp = TempDir::new().unwrap();
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(uploads.join("alice")).unwrap();

        let bare = Stager::open(tmp.path().join("a"), "py").unwrap();
        assert_eq!(bare.resolve_mount(Some("alice")).await, None);

        let stager = Stager::open(tmp.path().join("b"), "py")
            .unwrap()
            .with_upload_store(Arc::new(DirUploadStore::open(&uploads).unwrap()));
        assert_eq!(stager.resolve_mount(None).await, None);
        assert!(stager.resolve_mount(Some("alice")).await.is_some());
    }
}
