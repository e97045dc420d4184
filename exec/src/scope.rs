use std::ffi::CString;
use std::path::Path;

use crate::{Address, ConstructionError, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolHit {
    Bound(Address),
    /// Declared by an in-flight load, no address yet.
    Pending,
    Missing,
}

/// One entry in the ordered symbol search path.
pub trait SymbolSource {
    fn scope_name(&self) -> &str;
    fn find(&self, linker_name: &str) -> SymbolHit;
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    unit: UnitId,
    address: Option<Address>,
}

#[derive(Debug, Clone)]
pub(crate) struct EntryPoint {
    pub name: String,
    pub address: Address,
}

/// Per-unit record in a scope, kept in append order. Append order is the
/// order initializers run in.
#[derive(Debug)]
pub(crate) struct UnitRecord {
    pub unit: UnitId,
    pub name: String,
    pub initializers: Vec<EntryPoint>,
    pub finalizers: Vec<EntryPoint>,
    pub initialized: bool,
}

/// A named container of resolvable symbols that grows as units are linked
/// into it. Symbols are keyed by linker-level name; each binding remembers
/// the unit that owns it so one unit's bindings can be retracted together.
pub struct LinkageScope {
    name: String,
    symbols: im::HashMap<String, SymbolEntry>,
    units: Vec<UnitRecord>,
}

impl LinkageScope {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            symbols: im::HashMap::new(),
            units: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Announce a name before its address exists. Does nothing if the name
    /// is already present; a redefinition keeps the old binding visible
    /// until the new one commits.
    pub(crate) fn declare(&mut self, name: &str, unit: UnitId) {
        if !self.symbols.contains_key(name) {
            self.symbols.insert(
                name.to_string(),
                SymbolEntry {
                    unit,
                    address: None,
                },
            );
        }
    }

    /// Commit a binding. Returns true if this replaced a binding owned by
    /// a different unit (a redefinition).
    pub(crate) fn bind(&mut self, name: &str, unit: UnitId, address: Address) -> bool {
        let replaced = matches!(
            self.symbols.get(name),
            Some(entry) if entry.unit != unit
        );
        self.symbols.insert(
            name.to_string(),
            SymbolEntry {
                unit,
                address: Some(address),
            },
        );
        replaced
    }

    /// Remove a binding if it is owned by the given unit. Bindings taken
    /// over by a later redefinition are left alone.
    pub(crate) fn retract(&mut self, name: &str, unit: UnitId) -> bool {
        match self.symbols.get(name) {
            Some(entry) if entry.unit == unit => {
                self.symbols.remove(name);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn append_unit(&mut self, record: UnitRecord) {
        self.units.push(record);
    }

    pub(crate) fn remove_unit(&mut self, unit: UnitId) {
        self.units.retain(|r| r.unit != unit);
    }

    pub(crate) fn records(&self) -> &[UnitRecord] {
        &self.units
    }

    pub(crate) fn set_initialized(&mut self, unit: UnitId, initialized: bool) {
        for r in self.units.iter_mut() {
            if r.unit == unit {
                r.initialized = initialized;
            }
        }
    }

    pub fn debug(&self) {
        log::debug!("scope {}: {} symbols, {} units", self.name, self.symbols.len(), self.units.len());
        for (name, entry) in &self.symbols {
            match entry.address {
                Some(addr) => log::debug!(" {}:{}:{}", addr, entry.unit, name),
                None => log::debug!(" pending:{}:{}", entry.unit, name),
            }
        }
    }
}

impl SymbolSource for LinkageScope {
    fn scope_name(&self) -> &str {
        &self.name
    }

    fn find(&self, linker_name: &str) -> SymbolHit {
        match self.symbols.get(linker_name) {
            Some(SymbolEntry { address: Some(addr), .. }) => SymbolHit::Bound(*addr),
            Some(SymbolEntry { address: None, .. }) => SymbolHit::Pending,
            None => SymbolHit::Missing,
        }
    }
}

/// Fixed scope backed by the platform runtime support library, when one was
/// handed to the manager at construction.
pub struct RuntimeScope {
    name: String,
    lib: libloading::Library,
}

impl RuntimeScope {
    pub(crate) fn open(path: &Path) -> Result<Self, ConstructionError> {
        let lib = unsafe { libloading::Library::new(path) }.map_err(|source| {
            ConstructionError::RuntimeSupport {
                path: path.to_path_buf(),
                source,
            }
        })?;
        log::debug!("runtime support loaded: {}", path.display());
        Ok(Self {
            name: "platform".to_string(),
            lib,
        })
    }
}

impl SymbolSource for RuntimeScope {
    fn scope_name(&self) -> &str {
        &self.name
    }

    fn find(&self, linker_name: &str) -> SymbolHit {
        unsafe {
            let result: Result<libloading::Symbol<'_, unsafe extern "C" fn()>, libloading::Error> =
                self.lib.get(linker_name.as_bytes());
            match result {
                Ok(f) => SymbolHit::Bound(Address::from_ptr(f.into_raw().into_raw() as *const ())),
                Err(_) => SymbolHit::Missing,
            }
        }
    }
}

/// Scope exposing symbols already present in the host process image.
pub struct ProcessScope {
    name: String,
}

impl ProcessScope {
    pub(crate) fn new() -> Self {
        Self {
            name: "process".to_string(),
        }
    }
}

impl SymbolSource for ProcessScope {
    fn scope_name(&self) -> &str {
        &self.name
    }

    fn find(&self, linker_name: &str) -> SymbolHit {
        let cstr = match CString::new(linker_name) {
            Ok(s) => s,
            Err(_) => return SymbolHit::Missing,
        };
        let symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
        if symbol.is_null() {
            SymbolHit::Missing
        } else {
            SymbolHit::Bound(Address::from_ptr(symbol as *const ()))
        }
    }
}
