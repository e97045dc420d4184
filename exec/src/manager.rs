use std::collections::HashMap;
use std::path::PathBuf;

use crate::linker::{self, LinkContext};
use crate::memory::DEFAULT_RESERVATION;
use crate::resolver::{self, SymbolRequest};
use crate::{
    Address, BinaryFormat, CompiledUnit, ConstructionError, InProcessMapper, LinkError,
    LinkageScope, LookupError, MemoryMapper, ProcessScope, ResourceTracker, RuntimeScope,
    SymbolNameKind, SymbolSource, TargetDescription, UnitId, UnloadError,
};

pub struct ExecConfig {
    /// Size of the reserved address-space window all mapped code and data
    /// lives in.
    pub reservation: usize,
    /// Platform runtime support library, wired in as the second search
    /// scope when present.
    pub runtime_support: Option<PathBuf>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            reservation: DEFAULT_RESERVATION,
            runtime_support: None,
        }
    }
}

/// Owns the whole linkage state of one incremental session: the growing
/// main scope, the fixed runtime and process scopes, the memory window,
/// and one resource tracker per resident unit.
///
/// Mutating calls take `&mut self` and are serialized by the borrow
/// checker; `lookup` takes `&self` and may run concurrently with other
/// lookups, but not with a load or unload of the same manager.
pub struct ExecutionManager {
    target: TargetDescription,
    format: BinaryFormat,
    mapper: Box<dyn MemoryMapper>,
    main: LinkageScope,
    runtime: Option<RuntimeScope>,
    process: ProcessScope,
    trackers: HashMap<UnitId, ResourceTracker>,
}

impl ExecutionManager {
    pub fn new(target: TargetDescription) -> Result<Self, ConstructionError> {
        Self::create(target, ExecConfig::default())
    }

    /// One-time bring-up. A manager that fails to construct does not
    /// exist, so no later operation can be issued against it.
    pub fn create(
        target: TargetDescription,
        config: ExecConfig,
    ) -> Result<Self, ConstructionError> {
        let format = target.format()?;
        let mapper = InProcessMapper::reserve(config.reservation)
            .map_err(ConstructionError::Reserve)?;
        let runtime = match &config.runtime_support {
            Some(path) => Some(RuntimeScope::open(path)?),
            None => None,
        };
        log::debug!(
            "executor ready: triple={} features=[{}] format={:?}",
            target.triple(),
            target.features().join(","),
            format
        );
        Ok(Self {
            target,
            format,
            mapper: Box::new(mapper),
            main: LinkageScope::new("main"),
            runtime,
            process: ProcessScope::new(),
            trackers: HashMap::new(),
        })
    }

    /// Link a unit into the main scope under a fresh resource tracker. On
    /// failure every partial allocation is released before returning and
    /// the unit is not resident. Loading the same identity twice without
    /// an intervening unload is not deduplicated.
    pub fn load(&mut self, unit: CompiledUnit) -> Result<(), LinkError> {
        let id = unit.id();
        let mut tracker = ResourceTracker::new(unit);
        let ctx = LinkContext {
            format: self.format,
            runtime: self.runtime.as_ref(),
            process: &self.process,
        };
        let result = linker::link_unit(
            &tracker.unit,
            &mut self.main,
            self.mapper.as_mut(),
            &mut tracker.resources,
            ctx,
        );
        match result {
            Ok(()) => {
                self.trackers.insert(id, tracker);
                Ok(())
            }
            Err(e) => {
                log::error!("load of {} failed: {}", id, e);
                if let Err(release_err) = tracker.remove(&mut self.main, self.mapper.as_mut()) {
                    log::error!("rollback after failed load also failed: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Drop one unit's code, data and symbol bindings. Unloading a unit
    /// that was never loaded (or already unloaded) is a successful no-op.
    /// The tracking map entry is removed before resources are released, so
    /// the map stays consistent even when the release fails.
    pub fn unload(&mut self, unit: UnitId) -> Result<(), UnloadError> {
        match self.trackers.remove(&unit) {
            None => {
                log::debug!("unload {}: not resident, nothing to do", unit);
                Ok(())
            }
            Some(tracker) => tracker
                .remove(&mut self.main, self.mapper.as_mut())
                .map(|_unit| ()),
        }
    }

    /// Run module-level initializers for every resident unit that has not
    /// run them yet, in the order units were appended to the main scope.
    /// Idempotent per residency: a second call without intervening loads
    /// does nothing.
    pub fn run_initializers(&mut self) -> Result<(), LinkError> {
        let pending: Vec<(UnitId, Vec<(String, Address)>)> = self
            .main
            .records()
            .iter()
            .filter(|r| !r.initialized)
            .map(|r| {
                (
                    r.unit,
                    r.initializers
                        .iter()
                        .map(|e| (e.name.clone(), e.address))
                        .collect(),
                )
            })
            .collect();

        for (unit, entries) in pending {
            for (name, address) in entries {
                log::debug!("running initializer {}:{} @ {}", unit, name, address);
                unsafe {
                    let f: unsafe extern "C" fn() = std::mem::transmute(address.as_ptr::<()>());
                    f();
                }
            }
            self.main.set_initialized(unit, true);
        }
        Ok(())
    }

    /// Run finalizers for every initialized resident unit, in reverse
    /// append order, and mark them uninitialized again. Intended to run
    /// once at shutdown; a second call is a no-op.
    pub fn run_finalizers(&mut self) -> Result<(), LinkError> {
        let initialized: Vec<(UnitId, Vec<(String, Address)>)> = self
            .main
            .records()
            .iter()
            .rev()
            .filter(|r| r.initialized)
            .map(|r| {
                (
                    r.unit,
                    r.finalizers
                        .iter()
                        .map(|e| (e.name.clone(), e.address))
                        .collect(),
                )
            })
            .collect();

        for (unit, entries) in initialized {
            for (name, address) in entries {
                log::debug!("running finalizer {}:{} @ {}", unit, name, address);
                unsafe {
                    let f: unsafe extern "C" fn() = std::mem::transmute(address.as_ptr::<()>());
                    f();
                }
            }
            self.main.set_initialized(unit, false);
        }
        Ok(())
    }

    /// Resolve a name across the fixed search order: main scope, platform
    /// runtime scope, host process scope.
    pub fn lookup(&self, name: &str, kind: SymbolNameKind) -> Result<Address, LookupError> {
        let sources = self.search_order();
        resolver::search(&sources, SymbolRequest { name, kind }, self.format)
    }

    /// Resolve a mangled name and call it as `extern "C" fn(P) -> T`.
    ///
    /// The signature is whatever the caller claims it is; a mismatch with
    /// the actual code is undefined behavior, exactly as with any foreign
    /// call through a casted pointer.
    pub fn invoke<P, T>(&self, name: &str, args: P) -> Result<T, LookupError> {
        let addr = self.lookup(name, SymbolNameKind::Mangled)?;
        unsafe {
            type Entry<P, T> = unsafe extern "C" fn(P) -> T;
            log::debug!("invoking {} @ {}", name, addr);
            let f: Entry<P, T> = std::mem::transmute(addr.as_ptr::<()>());
            Ok(f(args))
        }
    }

    pub fn target(&self) -> &TargetDescription {
        &self.target
    }

    pub fn is_resident(&self, unit: UnitId) -> bool {
        self.trackers.contains_key(&unit)
    }

    pub fn resident_count(&self) -> usize {
        self.trackers.len()
    }

    /// Bytes currently allocated out of the reserved window.
    pub fn memory_used(&self) -> usize {
        self.mapper.used()
    }

    pub fn debug(&self) {
        log::debug!("MEM Used: {}", self.mapper.used());
        self.main.debug();
        crate::log_process_maps();
    }

    fn search_order(&self) -> Vec<&dyn SymbolSource> {
        let mut sources: Vec<&dyn SymbolSource> = vec![&self.main];
        if let Some(runtime) = &self.runtime {
            sources.push(runtime);
        }
        sources.push(&self.process);
        sources
    }
}

impl Drop for ExecutionManager {
    fn drop(&mut self) {
        log::debug!(
            "execution manager dropped: {} units resident, {} bytes in use",
            self.trackers.len(),
            self.mapper.used()
        );
    }
}
