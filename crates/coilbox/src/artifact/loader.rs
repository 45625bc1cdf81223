use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument};
use wasmtime::Engine;

use crate::artifact::{ArtifactError, ArtifactLoader, CompiledArtifact, Fingerprint};

/// Loads a guest module from bytes held in memory.
///
/// The fingerprint is computed on first use and reused for the lifetime of
/// the loader.
#[derive(Debug, Clone)]
pub struct BytesLoader {
    name: String,
    bytes: Arc<[u8]>,
    fingerprint: OnceLock<Fingerprint>,
}

impl BytesLoader {
    /// Create a loader for the given module bytes
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            fingerprint: OnceLock::new(),
        }
    }

    /// Read module bytes from a file on the host
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ArtifactError::ReadModule {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, len = bytes.len(), "read guest module");
        Ok(Self::new(path.display().to_string(), bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl ArtifactLoader for BytesLoader {
    fn fingerprint(&self) -> Fingerprint {
        *self
            .fingerprint
            .get_or_init(|| Fingerprint::of(&self.bytes))
    }

    #[instrument(skip(self, engine), fields(name = %self.name, len = self.bytes.len()))]
    fn load(&self, engine: &Engine) -> Result<CompiledArtifact, ArtifactError> {
        let artifact = CompiledArtifact::compile(engine, &self.bytes)?;
        debug!("compiled guest module");
        Ok(artifact)
    }
}
