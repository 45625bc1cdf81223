use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, instrument};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::sandbox::SandboxError;
use crate::types::MountConfig;

/// Guest path the scratch root is preopened at
pub const ROOT_GUEST_PATH: &str = "/";

/// Writable scratch directory present in every sandbox
pub const SCRATCH_DIR: &str = "/tmp";

/// A change applied to the scratch filesystem before the guest starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEntry {
    /// Create a directory (and its parents)
    Directory(String),
    /// Create a file (and its parent directories)
    File {
        path: String,
        contents: Vec<u8>,
        read_only: bool,
    },
}

impl FsEntry {
    pub fn dir(path: impl Into<String>) -> Self {
        FsEntry::Directory(path.into())
    }

    pub fn file(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        FsEntry::File {
            path: path.into(),
            contents: contents.into(),
            read_only: false,
        }
    }

    pub fn read_only_file(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        FsEntry::File {
            path: path.into(),
            contents: contents.into(),
            read_only: true,
        }
    }
}

/// Per-session scratch directory on the host that backs the guest's `/`.
///
/// A directory holding a read-only file is exposed to the guest without
/// write access, so nothing in it can be truncated, replaced or removed.
/// Writable directories below it get a preopen of their own. Removed from
/// the host when dropped.
#[derive(Debug)]
pub struct VirtualRoot {
    dir: TempDir,
    read_only_dirs: BTreeSet<PathBuf>,
}

/// One directory handed to the guest as a preopen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preopen {
    pub host: PathBuf,
    pub guest: String,
    pub writable: bool,
}

impl Preopen {
    fn perms(&self) -> (DirPerms, FilePerms) {
        if self.writable {
            (DirPerms::all(), FilePerms::all())
        } else {
            (DirPerms::READ, FilePerms::READ)
        }
    }
}

impl VirtualRoot {
    /// Create an empty scratch root
    pub fn create() -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("coilbox-")
            .tempdir()
            .map_err(|source| SandboxError::Filesystem {
                path: std::env::temp_dir(),
                source,
            })?;
        debug!(path = ?dir.path(), "created scratch root");
        Ok(Self {
            dir,
            read_only_dirs: BTreeSet::new(),
        })
    }

    /// Host path of the scratch root
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Host path backing a guest path under the scratch root.
    ///
    /// Leading slashes are accepted (the guest sees this directory as `/`).
    /// Parent references and empty paths are rejected.
    pub fn host_path(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.path().join(relative_guest_path(guest_path)?))
    }

    /// Write a file, creating parent directories.
    ///
    /// A read-only file makes its whole parent directory read-only to the
    /// guest.
    #[instrument(skip(self, contents), fields(len = contents.len()))]
    pub fn write_file(
        &mut self,
        guest_path: &str,
        contents: &[u8],
        read_only: bool,
    ) -> Result<PathBuf, SandboxError> {
        let relative = relative_guest_path(guest_path)?;
        let path = self.path().join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SandboxError::Filesystem {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, contents).map_err(|source| SandboxError::Filesystem {
            path: path.clone(),
            source,
        })?;

        if read_only {
            self.read_only_dirs
                .insert(relative.parent().map(Path::to_path_buf).unwrap_or_default());
            let mut permissions = fs::metadata(&path)
                .map_err(|source| SandboxError::Filesystem {
                    path: path.clone(),
                    source,
                })?
                .permissions();
            permissions.set_readonly(true);
            fs::set_permissions(&path, permissions).map_err(|source| {
                SandboxError::Filesystem {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        debug!(?path, read_only, "wrote file to scratch root");
        Ok(path)
    }

    /// Create a directory and its parents
    pub fn create_dir(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let path = self.host_path(guest_path)?;
        fs::create_dir_all(&path).map_err(|source| SandboxError::Filesystem {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Apply one filesystem mutation
    pub fn apply(&mut self, entry: &FsEntry) -> Result<PathBuf, SandboxError> {
        match entry {
            FsEntry::Directory(path) => self.create_dir(path),
            FsEntry::File {
                path,
                contents,
                read_only,
            } => self.write_file(path, contents, *read_only),
        }
    }

    /// Read a file back out of the scratch root
    pub fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.host_path(guest_path)?;
        fs::read(&path).map_err(|source| SandboxError::Filesystem { path, source })
    }

    /// Whether the guest may modify entries directly inside this directory
    pub fn is_writable_dir(&self, guest_path: &str) -> bool {
        let relative = match guest_path.trim_start_matches('/') {
            "" => PathBuf::new(),
            _ => match relative_guest_path(guest_path) {
                Ok(relative) => relative,
                Err(_) => return false,
            },
        };
        !self.read_only_dirs.contains(&relative)
    }

    /// Directories to preopen, in descriptor order.
    ///
    /// The root comes first (fd 3), then each mount, then every scratch
    /// directory whose access differs from its parent's. Scratch directories
    /// hidden by a mount are skipped.
    pub fn preopens(&self, mounts: &[MountConfig]) -> Result<Vec<Preopen>, SandboxError> {
        let mut preopens = vec![Preopen {
            host: self.path().to_path_buf(),
            guest: ROOT_GUEST_PATH.to_string(),
            writable: self.is_writable_dir(ROOT_GUEST_PATH),
        }];
        preopens.extend(mounts.iter().map(|mount| Preopen {
            host: PathBuf::from(&mount.source),
            guest: mount.target.clone(),
            writable: mount.writable,
        }));

        if self.read_only_dirs.is_empty() {
            return Ok(preopens);
        }
        let mounted: BTreeSet<&str> = mounts
            .iter()
            .map(|mount| mount.target.trim_end_matches('/'))
            .collect();
        let mut pending = vec![(PathBuf::new(), self.is_writable_dir(ROOT_GUEST_PATH))];
        while let Some((dir, parent_writable)) = pending.pop() {
            let host_dir = self.path().join(&dir);
            let entries = fs::read_dir(&host_dir).map_err(|source| SandboxError::Filesystem {
                path: host_dir.clone(),
                source,
            })?;
            let mut children = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| SandboxError::Filesystem {
                    path: host_dir.clone(),
                    source,
                })?;
                let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
                if is_dir {
                    children.push(dir.join(entry.file_name()));
                }
            }
            children.sort();

            for child in children.into_iter().rev() {
                let guest = format!("/{}", child.to_string_lossy());
                if mounted.contains(guest.as_str()) {
                    continue;
                }
                let writable = !self.read_only_dirs.contains(&child);
                pending.push((child.clone(), writable));
                if writable != parent_writable {
                    preopens.push(Preopen {
                        host: self.path().join(&child),
                        guest,
                        writable,
                    });
                }
            }
        }
        Ok(preopens)
    }

    /// Preopen the scratch root, the mounts and any access boundaries
    /// inside the scratch root
    pub(crate) fn preopen(
        &self,
        builder: &mut WasiCtxBuilder,
        mounts: &[MountConfig],
    ) -> Result<(), SandboxError> {
        for preopen in self.preopens(mounts)? {
            let (dir_perms, file_perms) = preopen.perms();
            builder
                .preopened_dir(&preopen.host, &preopen.guest, dir_perms, file_perms)
                .map_err(|source| SandboxError::Preopen {
                    guest_path: preopen.guest.clone(),
                    source,
                })?;
            debug!(
                host = ?preopen.host,
                guest = %preopen.guest,
                writable = preopen.writable,
                "preopened directory"
            );
        }
        Ok(())
    }
}

fn relative_guest_path(guest_path: &str) -> Result<PathBuf, SandboxError> {
    let mut relative = PathBuf::new();
    for component in Path::new(guest_path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPath(format!(
                    "path traversal not allowed: {guest_path}"
                )));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(SandboxError::InvalidPath(format!(
            "path does not name an entry: {guest_path:?}"
        )));
    }
    Ok(relative)
}

/// Check mounts against the host and return the ones to preopen.
///
/// A missing source is an error unless the mount is optional, in which case
/// it is skipped. Targets must be absolute guest paths without parent
/// references.
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<Vec<MountConfig>, SandboxError> {
    let mut active = Vec::with_capacity(mounts.len());
    for mount in mounts {
        if !mount.target.starts_with('/') || mount.target.split('/').any(|part| part == "..") {
            return Err(SandboxError::InvalidPath(format!(
                "mount target must be an absolute path: {}",
                mount.target
            )));
        }
        if !Path::new(&mount.source).is_dir() {
            if mount.optional {
                debug!(source = %mount.source, "skipping missing optional mount");
                continue;
            }
            return Err(SandboxError::MountSourceNotFound(mount.source.clone()));
        }
        active.push(mount.clone());
    }
    Ok(active)
}
