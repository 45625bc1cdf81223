//! On-disk cache of compiled artifacts
//!
//! A cache record is the source [`Fingerprint`] followed by the serialized
//! artifact. A record whose fingerprint does not match the current source, or
//! that cannot be read or deserialized, is deleted and rebuilt. The cache is
//! an optimization only: none of its failures reach the caller.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use wasmtime::Engine;

use crate::artifact::{
    ArtifactError, ArtifactLoader, CompiledArtifact, FINGERPRINT_LEN, Fingerprint,
};

/// How a cached load was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No cache path configured; compiled directly
    Disabled,
    /// Valid record found; no compilation
    Hit,
    /// No record on disk; compiled and stored
    Miss,
    /// Record was stale or unreadable; deleted, compiled and stored
    Invalidated,
}

/// Internal cache failures. Logged and discarded, never returned.
#[derive(Debug, Error)]
enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache record is shorter than a fingerprint")]
    Truncated,

    #[error("cached fingerprint {found} does not match source fingerprint {expected}")]
    Stale {
        found: Fingerprint,
        expected: Fingerprint,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Wraps an [`ArtifactLoader`] with a persisted copy of its compiled output.
///
/// The compiled code is not portable; do not move cache files between
/// machines or wasmtime versions (a version mismatch is detected and rebuilt).
#[derive(Debug)]
pub struct FileCache<L> {
    cache_path: Option<PathBuf>,
    upstream: L,
}

impl<L: ArtifactLoader> FileCache<L> {
    /// Cache `upstream` at `cache_path`. `None` disables caching.
    pub fn new(cache_path: Option<PathBuf>, upstream: L) -> Self {
        Self {
            cache_path,
            upstream,
        }
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    pub fn upstream(&self) -> &L {
        &self.upstream
    }

    /// Load the artifact and report whether the cache was used
    #[instrument(skip(self, engine), fields(cache_path = ?self.cache_path))]
    pub fn load_with_status(
        &self,
        engine: &Engine,
    ) -> Result<(CompiledArtifact, CacheStatus), ArtifactError> {
        let Some(path) = self.cache_path.as_deref() else {
            let artifact = self.upstream.load(engine)?;
            return Ok((artifact, CacheStatus::Disabled));
        };

        let expected = self.upstream.fingerprint();
        let status = match read_record(path, &expected, engine) {
            Ok(Some(artifact)) => {
                debug!(fingerprint = %expected, "artifact cache hit");
                return Ok((artifact, CacheStatus::Hit));
            }
            Ok(None) => CacheStatus::Miss,
            Err(e) => {
                warn!(error = %e, "discarding invalid artifact cache record");
                discard(path);
                CacheStatus::Invalidated
            }
        };

        let artifact = self.upstream.load(engine)?;

        match write_record(path, &expected, &artifact) {
            Ok(len) => debug!(len, ?status, "stored artifact cache record"),
            Err(e) => {
                warn!(error = %e, "failed to store artifact cache record");
                discard(path);
            }
        }

        Ok((artifact, status))
    }
}

impl<L: ArtifactLoader> ArtifactLoader for FileCache<L> {
    fn fingerprint(&self) -> Fingerprint {
        self.upstream.fingerprint()
    }

    fn load(&self, engine: &Engine) -> Result<CompiledArtifact, ArtifactError> {
        self.load_with_status(engine).map(|(artifact, _)| artifact)
    }
}

/// Read and validate a cache record. `Ok(None)` means there is no record.
fn read_record(
    path: &Path,
    expected: &Fingerprint,
    engine: &Engine,
) -> Result<Option<CompiledArtifact>, CacheError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut stored = [0u8; FINGERPRINT_LEN];
    file.read_exact(&mut stored).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CacheError::Truncated,
        _ => CacheError::Io(e),
    })?;

    let found = Fingerprint::from_slice(&stored).ok_or(CacheError::Truncated)?;
    if found != *expected {
        return Err(CacheError::Stale {
            found,
            expected: *expected,
        });
    }

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    // SAFETY: the record carries the fingerprint of the current source, so
    // the body was written by `write_record` from a serialized artifact.
    let artifact = unsafe { CompiledArtifact::deserialize(engine, &contents) }?;
    Ok(Some(artifact))
}

/// Write `fingerprint || serialize(artifact)` to `path`, replacing any prior
/// record. Returns the record length.
fn write_record(
    path: &Path,
    fingerprint: &Fingerprint,
    artifact: &CompiledArtifact,
) -> Result<usize, CacheError> {
    let body = artifact.serialize()?;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    // Write beside the target and rename so readers never see a partial record
    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(fingerprint.as_bytes())?;
    staged.write_all(&body)?;
    staged.flush()?;
    staged.persist(path).map_err(|e| e.error)?;

    Ok(FINGERPRINT_LEN + body.len())
}

/// Best-effort removal of a bad record
fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(?path, "removed artifact cache record"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(?path, error = %e, "could not remove artifact cache record"),
    }
}
