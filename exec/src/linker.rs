use itertools::Itertools;
use object::SectionKind;

use crate::resolver::{self, SymbolNameKind, SymbolRequest};
use crate::scope::{EntryPoint, UnitRecord};
use crate::tracker::UnitResources;
use crate::{
    Address, BinaryFormat, CompiledUnit, LinkError, LinkageScope, MemoryMapper, Perm,
    ProcessScope, RelocKind, Relocation, RuntimeScope, SymbolHit, SymbolPlacement, SymbolSource,
};

pub(crate) struct LinkContext<'a> {
    pub format: BinaryFormat,
    pub runtime: Option<&'a RuntimeScope>,
    pub process: &'a ProcessScope,
}

fn section_perm(kind: SectionKind) -> Option<Perm> {
    match kind {
        SectionKind::Text => Some(Perm::Rx),
        SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => Some(Perm::Ro),
        SectionKind::Data | SectionKind::UninitializedData => Some(Perm::Rw),
        // metadata and friends are not mapped
        _ => None,
    }
}

/// Link `unit` into `scope`. Every allocation is attributed to `res` as it
/// happens, so on any error the caller releases `res` and nothing of this
/// unit stays resident. The scope's existing bindings are only modified by
/// the final commit phase, which cannot fail.
pub(crate) fn link_unit(
    unit: &CompiledUnit,
    scope: &mut LinkageScope,
    mapper: &mut dyn MemoryMapper,
    res: &mut UnitResources,
    ctx: LinkContext<'_>,
) -> Result<(), LinkError> {
    log::debug!("linking {} ({}) into scope {}", unit.name(), unit.id(), scope.name());

    if let Some(name) = unit.symbols.iter().map(|s| &s.name).duplicates().next() {
        log::error!(" duplicate symbol in {}: {}", unit.name(), name);
        return Err(LinkError::DuplicateSymbol(name.clone()));
    }

    // announce exports before any memory exists; concurrent readers of the
    // scope see these as registered-but-unresolved
    for sym in unit.exports() {
        if scope.find(&sym.name) == SymbolHit::Missing {
            scope.declare(&sym.name, unit.id());
            res.track_symbol(&sym.name);
        }
    }

    // place sections
    let mut bases: Vec<Option<Address>> = Vec::with_capacity(unit.sections.len());
    let mut seals: Vec<(usize, Perm)> = vec![];
    for section in &unit.sections {
        let total = section.mem_size();
        let perm = section_perm(section.kind);
        if total == 0 || perm.is_none() {
            bases.push(None);
            continue;
        }
        let block_name = format!("{}:{}", unit.name(), section.name);
        let mut block = mapper.allocate(&block_name, total, section.align)?;
        block.copy(&section.bytes);
        bases.push(Some(Address::from_ptr(block.as_ptr())));
        let index = res.track_block(block);
        match perm {
            Some(Perm::Rw) | None => {}
            Some(p) => seals.push((index, p)),
        }
    }

    // compute every defined symbol's address
    let mut local: im::HashMap<String, Address> = im::HashMap::new();
    for sym in &unit.symbols {
        let addr = match sym.placement {
            SymbolPlacement::Absolute(a) => Address::new(a),
            SymbolPlacement::Section { section, offset } => {
                match bases.get(section).copied().flatten() {
                    Some(base) => Address::new(base.as_usize() + offset as usize),
                    None => {
                        return Err(LinkError::UndefinedSection {
                            symbol: sym.name.clone(),
                            section: section_name(unit, section),
                        })
                    }
                }
            }
        };
        local.insert(sym.name.clone(), addr);
    }

    // initializer entry points must come from the unit itself; resolve them
    // now so a bad entry name fails the load, not a later initializer run
    let initializers = entry_points(&unit.initializers, &local)?;
    let finalizers = entry_points(&unit.finalizers, &local)?;

    // resolve and patch relocations
    {
        let mut sources: Vec<&dyn SymbolSource> = vec![&*scope];
        if let Some(runtime) = ctx.runtime {
            sources.push(runtime);
        }
        sources.push(ctx.process);

        for r in &unit.relocations {
            let place_base = match bases.get(r.section).copied().flatten() {
                Some(base) => base,
                None => {
                    return Err(LinkError::UndefinedSection {
                        symbol: r.name.clone(),
                        section: section_name(unit, r.section),
                    })
                }
            };
            let target = match local.get(&r.name) {
                Some(addr) => *addr,
                None => {
                    let request = SymbolRequest {
                        name: &r.name,
                        kind: SymbolNameKind::Raw,
                    };
                    match resolver::search(&sources, request, ctx.format) {
                        Ok(addr) => addr,
                        Err(_) => {
                            log::error!(" symbol {} missing", &r.name);
                            return Err(LinkError::MissingSymbol(r.name.clone()));
                        }
                    }
                }
            };
            patch(place_base, r, target)?;
        }
    }

    if log::log_enabled!(log::Level::Trace) {
        for block in res.blocks.iter() {
            unsafe {
                let buf = std::slice::from_raw_parts(block.as_ptr(), block.size());
                log::trace!("{}:\n{}", block.name(), pretty_hex::pretty_hex(&buf));
            }
        }
    }

    // seal final permissions before anything becomes visible
    for (index, perm) in seals {
        mapper.protect(&mut res.blocks[index], perm)?;
    }

    // commit: bind exports and append the unit record. Infallible, so a
    // redefinition never destroys the old binding on a failing load.
    for sym in unit.exports() {
        if let Some(addr) = local.get(&sym.name) {
            if scope.bind(&sym.name, unit.id(), *addr) {
                log::debug!("redefined {} -> {}", &sym.name, addr);
            }
            if !res.registered.iter().any(|n| n == &sym.name) {
                res.track_symbol(&sym.name);
            }
        }
    }
    scope.append_unit(UnitRecord {
        unit: unit.id(),
        name: unit.name().to_string(),
        initializers,
        finalizers,
        initialized: false,
    });

    log::debug!(
        "linked {}: {} blocks, {} exports",
        unit.name(),
        res.blocks.len(),
        res.registered.len()
    );
    Ok(())
}

fn section_name(unit: &CompiledUnit, index: usize) -> String {
    unit.sections
        .get(index)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("#{}", index))
}

fn entry_points(
    names: &[String],
    local: &im::HashMap<String, Address>,
) -> Result<Vec<EntryPoint>, LinkError> {
    names
        .iter()
        .map(|name| match local.get(name) {
            Some(addr) => Ok(EntryPoint {
                name: name.clone(),
                address: *addr,
            }),
            None => Err(LinkError::InitializerMissing(name.clone())),
        })
        .collect()
}

fn patch(place_base: Address, r: &Relocation, target: Address) -> Result<(), LinkError> {
    let place = place_base.as_usize() + r.offset as usize;
    match r.kind {
        RelocKind::Abs64 => {
            let value = (target.as_usize() as i128 + r.addend as i128) as u64;
            log::trace!("patch abs64 {:#08x} <- {:#08x} ({})", place, value, &r.name);
            unsafe {
                std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), place as *mut u8, 8);
            }
        }
        RelocKind::Rel32 => {
            // TODO: far targets (process symbols outside the window) need a
            // GOT slot inside the window; until then only Abs64 reaches them
            let value = target.as_usize() as i128 + r.addend as i128 - place as i128;
            let value = i32::try_from(value)
                .map_err(|_| LinkError::RelocationOutOfRange(r.name.clone()))?;
            log::trace!("patch rel32 {:#08x} <- {:#x} ({})", place, value, &r.name);
            unsafe {
                std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), place as *mut u8, 4);
            }
        }
    }
    Ok(())
}
