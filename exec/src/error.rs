use std::fmt;
use std::io;
use std::path::PathBuf;

/// Setup of the manager itself failed. Fatal: no instance exists and no
/// load/unload/lookup call can be made.
#[derive(Debug)]
pub enum ConstructionError {
    Reserve(io::Error),
    RuntimeSupport {
        path: PathBuf,
        source: libloading::Error,
    },
    UnsupportedTarget(String),
}

impl std::error::Error for ConstructionError {}
impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionError::Reserve(e) => {
                write!(f, "failed to reserve executor memory window: {}", e)
            }
            ConstructionError::RuntimeSupport { path, source } => {
                write!(
                    f,
                    "failed to load runtime support library {}: {}",
                    path.display(),
                    source
                )
            }
            ConstructionError::UnsupportedTarget(triple) => {
                write!(f, "unsupported target: {}", triple)
            }
        }
    }
}

#[derive(Debug)]
pub enum MapError {
    OutOfMemory { requested: usize },
    InvalidLayout { size: usize, align: usize },
    Protect(io::Error),
}

impl std::error::Error for MapError {}
impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory { requested } => {
                write!(f, "executor window exhausted, requested {:#x} bytes", requested)
            }
            MapError::InvalidLayout { size, align } => {
                write!(f, "invalid block layout: size {:#x}, align {:#x}", size, align)
            }
            MapError::Protect(e) => write!(f, "mprotect failed: {}", e),
        }
    }
}

/// One unit failed to map, relocate or register. Scoped to a single load;
/// the manager stays usable and the failed unit is not resident.
#[derive(Debug)]
pub enum LinkError {
    DuplicateSymbol(String),
    MissingSymbol(String),
    UndefinedSection { symbol: String, section: String },
    RelocationOutOfRange(String),
    InitializerMissing(String),
    Memory(MapError),
}

impl std::error::Error for LinkError {}
impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::DuplicateSymbol(name) => write!(f, "duplicate symbol: {}", name),
            LinkError::MissingSymbol(name) => write!(f, "missing symbol: {}", name),
            LinkError::UndefinedSection { symbol, section } => {
                write!(f, "symbol {} placed in unmapped section {}", symbol, section)
            }
            LinkError::RelocationOutOfRange(name) => {
                write!(f, "relocation target out of range: {}", name)
            }
            LinkError::InitializerMissing(name) => {
                write!(f, "initializer entry point not defined by unit: {}", name)
            }
            LinkError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl From<MapError> for LinkError {
    fn from(e: MapError) -> Self {
        LinkError::Memory(e)
    }
}

/// Releasing a tracker's resources failed. The tracking map entry is
/// already gone when this surfaces, so retrying the unload is a no-op.
#[derive(Debug)]
pub enum UnloadError {
    Release { unit: String, source: MapError },
}

impl std::error::Error for UnloadError {}
impl fmt::Display for UnloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnloadError::Release { unit, source } => {
                write!(f, "failed to release resources of unit {}: {}", unit, source)
            }
        }
    }
}

#[derive(Debug)]
pub enum LookupError {
    /// Absent from every searched scope. Expected in normal operation when
    /// probing for optional symbols.
    NotFound(String),
    /// Registered but not yet materialized; the owning load is still in
    /// flight. Retry once that load has completed.
    Unresolved(String),
}

impl std::error::Error for LookupError {}
impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NotFound(name) => write!(f, "symbol not found: {}", name),
            LookupError::Unresolved(name) => {
                write!(f, "symbol registered but has no address yet: {}", name)
            }
        }
    }
}
