//! Compiled guest artifacts
//!
//! Turns guest module bytes into a ready-to-instantiate wasmtime [`Module`],
//! identified by a [`Fingerprint`] of the source bytes it was built from.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use wasmtime::{Engine, Module};

pub use crate::artifact::cache::{CacheStatus, FileCache};
pub use crate::artifact::loader::BytesLoader;

mod cache;
mod loader;

/// Length in bytes of a [`Fingerprint`]
pub const FINGERPRINT_LEN: usize = 32;

/// Exports an asyncify-instrumented module carries
pub(crate) const ASYNCIFY_EXPORTS: [&str; 5] = [
    "asyncify_start_unwind",
    "asyncify_stop_unwind",
    "asyncify_start_rewind",
    "asyncify_stop_rewind",
    "asyncify_get_state",
];

/// Errors that occur while producing a compiled artifact
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to compile guest module: {0}")]
    Compilation(#[source] wasmtime::Error),

    #[error("failed to read guest module at {path}: {source}")]
    ReadModule {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize compiled artifact: {0}")]
    Serialize(#[source] wasmtime::Error),

    #[error("failed to deserialize compiled artifact: {0}")]
    Deserialize(#[source] wasmtime::Error),

    #[error("failed to create engine: {0}")]
    Engine(#[source] wasmtime::Error),
}

/// Content hash of the exact source bytes an artifact was compiled from
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Hash the given source bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Rebuild a fingerprint from stored bytes. Returns `None` on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; FINGERPRINT_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// An engine-specific compiled guest module.
///
/// Immutable once produced. Cloning is cheap and clones share the same
/// compiled code, so one artifact can back many sessions on many threads.
/// Native resources are released when the last clone is dropped.
#[derive(Clone)]
pub struct CompiledArtifact {
    module: Module,
}

impl CompiledArtifact {
    /// Compile module bytes (binary or text format)
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, ArtifactError> {
        let module = Module::new(engine, bytes).map_err(ArtifactError::Compilation)?;
        Ok(Self { module })
    }

    /// Serialize the compiled code for the on-disk cache
    pub fn serialize(&self) -> Result<Vec<u8>, ArtifactError> {
        self.module.serialize().map_err(ArtifactError::Serialize)
    }

    /// Load previously serialized compiled code.
    ///
    /// # Safety
    ///
    /// `bytes` must come from [`CompiledArtifact::serialize`] on a compatible
    /// engine. Wasmtime checks the engine and version header, but cannot
    /// validate the machine code itself.
    pub(crate) unsafe fn deserialize(engine: &Engine, bytes: &[u8]) -> Result<Self, ArtifactError> {
        // SAFETY: forwarded to the caller.
        let module = unsafe { Module::deserialize(engine, bytes) }
            .map_err(ArtifactError::Deserialize)?;
        Ok(Self { module })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Whether the module exports the named function
    pub fn exports_function(&self, name: &str) -> bool {
        self.module
            .get_export(name)
            .is_some_and(|export| export.func().is_some())
    }

    /// Whether the module carries the asyncify unwind/rewind exports
    pub fn is_async_capable(&self) -> bool {
        ASYNCIFY_EXPORTS
            .iter()
            .all(|name| self.exports_function(name))
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("name", &self.module.name())
            .field("async_capable", &self.is_async_capable())
            .finish()
    }
}

/// Produces compiled artifacts for one fixed guest module
pub trait ArtifactLoader {
    /// Fingerprint of the source bytes this loader compiles
    fn fingerprint(&self) -> Fingerprint;

    /// Produce a compiled artifact for `engine`
    fn load(&self, engine: &Engine) -> Result<CompiledArtifact, ArtifactError>;
}

impl<L: ArtifactLoader + ?Sized> ArtifactLoader for &L {
    fn fingerprint(&self) -> Fingerprint {
        (**self).fingerprint()
    }

    fn load(&self, engine: &Engine) -> Result<CompiledArtifact, ArtifactError> {
        (**self).load(engine)
    }
}

/// Create an engine suitable for sandbox sessions (fuel metering enabled)
pub fn new_engine() -> Result<Engine, ArtifactError> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.cranelift_opt_level(wasmtime::OptLevel::Speed);
    Engine::new(&config).map_err(ArtifactError::Engine)
}
