use crate::{CompiledUnit, LinkageScope, MappedBlock, MemoryMapper, UnitId, UnloadError};

/// Everything one load call allocated: mapped blocks plus the names it
/// registered into the target scope. Attributed as the load progresses so
/// one release always covers a partial load too.
#[derive(Default)]
pub(crate) struct UnitResources {
    pub(crate) blocks: Vec<MappedBlock>,
    pub(crate) registered: Vec<String>,
}

impl UnitResources {
    pub(crate) fn track_block(&mut self, block: MappedBlock) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub(crate) fn track_symbol(&mut self, name: &str) {
        self.registered.push(name.to_string());
    }

    pub(crate) fn release(
        self,
        unit: UnitId,
        unit_name: &str,
        scope: &mut LinkageScope,
        mapper: &mut dyn MemoryMapper,
    ) -> Result<(), UnloadError> {
        // symbols go first so nothing resolves into memory being freed
        for name in &self.registered {
            if scope.retract(name, unit) {
                log::debug!("retracted {}:{}", unit, name);
            }
        }
        scope.remove_unit(unit);

        let mut first_err = None;
        for block in self.blocks {
            let name = block.name().to_string();
            if let Err(e) = mapper.release(block) {
                log::error!("failed to release block {}: {}", name, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(source) => Err(UnloadError::Release {
                unit: unit_name.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Handle to the live resources of exactly one loaded unit. Owns the unit
/// itself from load until unload. Removal consumes the tracker, so a
/// second removal of the same resources is unrepresentable.
pub struct ResourceTracker {
    pub(crate) unit: CompiledUnit,
    pub(crate) resources: UnitResources,
}

impl ResourceTracker {
    pub(crate) fn new(unit: CompiledUnit) -> Self {
        Self {
            unit,
            resources: UnitResources::default(),
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit.id()
    }

    /// Release every resource this load allocated and hand the unit back.
    /// Scope entries are gone even when a block release fails.
    pub(crate) fn remove(
        self,
        scope: &mut LinkageScope,
        mapper: &mut dyn MemoryMapper,
    ) -> Result<CompiledUnit, UnloadError> {
        let ResourceTracker { unit, resources } = self;
        log::debug!(
            "removing unit {} ({}): {} blocks, {} symbols",
            unit.name(),
            unit.id(),
            resources.blocks.len(),
            resources.registered.len()
        );
        resources.release(unit.id(), unit.name(), scope, mapper)?;
        Ok(unit)
    }
}
