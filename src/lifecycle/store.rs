//! On-disk application store
//!
//! Each hosted app lives in `<root>/<app>/`. Presence of that directory is
//! the only persisted lifecycle state.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Deepest directory nesting `remove` will descend into
pub const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid application name '{0}'")]
    InvalidName(String),

    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    #[error("install payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("install payload is not a valid zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive entry '{0}' escapes the application directory")]
    UnsafeEntry(String),

    #[error("archive does not contain the application folder '{0}'")]
    MissingRoot(String),

    #[error("directory tree under {} is nested deeper than {} levels", .0.display(), MAX_TREE_DEPTH)]
    TooDeep(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AppStore {
    root: PathBuf,
}

impl AppStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `app`. Names must be a single plain path component.
    pub fn app_dir(&self, app: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(app).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == app => Ok(self.root.join(app)),
            _ => Err(StoreError::InvalidName(app.to_string())),
        }
    }

    pub fn exists(&self, app: &str) -> bool {
        self.app_dir(app).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    /// Delete the app's tree. Returns `false` when nothing was installed.
    pub fn remove(&self, app: &str) -> Result<bool, StoreError> {
        let dir = self.app_dir(app)?;
        let meta = match fs::symlink_metadata(&dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            remove_tree(&dir)?;
        } else {
            // A link or stray file in place of the folder; never follow it
            fs::remove_file(&dir)?;
        }
        info!("Removed application {}", app);
        Ok(true)
    }

    /// Unpack a base64-encoded zip archive. Line breaks in the payload are
    /// tolerated.
    pub fn install_base64(&self, app: &str, payload: &str) -> Result<(), StoreError> {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD.decode(compact.as_bytes())?;
        self.install_archive(app, &bytes)
    }

    /// Extract a zip archive whose top-level folder is `<app>/` into the store.
    ///
    /// Any previous install is replaced. Entries outside `<app>/` are skipped;
    /// entries that would land outside the store root fail the install. On
    /// failure the partially written tree is removed.
    pub fn install_archive(&self, app: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = self.app_dir(app)?;
        fs::create_dir_all(&self.root)?;
        self.remove(app)?;

        let result = self.extract(app, bytes).and_then(|()| {
            if dir.is_dir() {
                Ok(())
            } else {
                Err(StoreError::MissingRoot(app.to_string()))
            }
        });

        if let Err(e) = &result {
            warn!("Install of {} failed: {}", app, e);
            if let Err(cleanup) = self.remove(app) {
                warn!("Failed to clean up partial install of {}: {}", app, cleanup);
            }
        } else {
            info!("Installed application {} into {}", app, dir.display());
        }
        result
    }

    fn extract(&self, app: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let relative = entry
                .enclosed_name()
                .ok_or_else(|| StoreError::UnsafeEntry(entry.name().to_string()))?;

            if relative.components().next() != Some(Component::Normal(app.as_ref())) {
                debug!("Skipping archive entry outside {}: {}", app, entry.name());
                continue;
            }

            let target = self.root.join(&relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    }
}

/// Post-order delete with an explicit stack. Links are removed as files and
/// never followed, so cycles cannot occur; depth is still bounded.
fn remove_tree(root: &Path) -> Result<(), StoreError> {
    let mut pending = vec![(root.to_path_buf(), 0usize, false)];

    while let Some((directory, depth, children_done)) = pending.pop() {
        if children_done {
            fs::remove_dir(&directory)?;
            continue;
        }
        if depth > MAX_TREE_DEPTH {
            return Err(StoreError::TooDeep(root.to_path_buf()));
        }

        pending.push((directory.clone(), depth, true));
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push((path, depth + 1, false));
            } else {
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}
