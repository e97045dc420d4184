use object::SectionKind;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIT: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of one compiled unit. Identity, not
/// content: two units built from identical input still get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u64);

impl UnitId {
    fn fresh() -> Self {
        UnitId(NEXT_UNIT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub(crate) name: String,
    pub(crate) kind: SectionKind,
    pub(crate) bytes: Vec<u8>,
    pub(crate) zero: usize,
    pub(crate) align: usize,
}

impl Section {
    pub fn new(name: &str, kind: SectionKind, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bytes,
            zero: 0,
            align: 16,
        }
    }

    pub fn code(name: &str, bytes: Vec<u8>) -> Self {
        Self::new(name, SectionKind::Text, bytes)
    }

    pub fn data(name: &str, bytes: Vec<u8>) -> Self {
        Self::new(name, SectionKind::Data, bytes)
    }

    pub fn rodata(name: &str, bytes: Vec<u8>) -> Self {
        Self::new(name, SectionKind::ReadOnlyData, bytes)
    }

    pub fn bss(name: &str, size: usize) -> Self {
        let mut s = Self::new(name, SectionKind::UninitializedData, vec![]);
        s.zero = size;
        s
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub(crate) fn mem_size(&self) -> usize {
        self.bytes.len() + self.zero
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPlacement {
    /// Offset into one of the unit's own sections.
    Section { section: usize, offset: u64 },
    /// Already-resolved host address, e.g. a runtime hook the front end
    /// wires in directly.
    Absolute(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLinkage {
    /// Registered into the target scope; visible to later units and lookups.
    Export,
    /// Resolvable only within this unit.
    Local,
}

#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub(crate) name: String,
    pub(crate) placement: SymbolPlacement,
    pub(crate) linkage: SymbolLinkage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 64-bit address, S + A.
    Abs64,
    /// 32-bit pc-relative, S + A - P.
    Rel32,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub(crate) section: usize,
    pub(crate) offset: u64,
    pub(crate) name: String,
    pub(crate) kind: RelocKind,
    pub(crate) addend: i64,
}

/// One increment of compiled code and data, produced by the front end and
/// owned by the execution manager from load until unload. Symbol names are
/// linker-level names; any source-level mangling happened upstream.
#[derive(Debug)]
pub struct CompiledUnit {
    id: UnitId,
    name: String,
    pub(crate) sections: Vec<Section>,
    pub(crate) symbols: Vec<SymbolDef>,
    pub(crate) relocations: Vec<Relocation>,
    pub(crate) initializers: Vec<String>,
    pub(crate) finalizers: Vec<String>,
}

impl CompiledUnit {
    pub fn new(name: &str) -> Self {
        Self {
            id: UnitId::fresh(),
            name: name.to_string(),
            sections: vec![],
            symbols: vec![],
            relocations: vec![],
            initializers: vec![],
            finalizers: vec![],
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_section(&mut self, section: Section) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    pub fn define(&mut self, name: &str, placement: SymbolPlacement, linkage: SymbolLinkage) {
        self.symbols.push(SymbolDef {
            name: name.to_string(),
            placement,
            linkage,
        });
    }

    pub fn export(&mut self, name: &str, section: usize, offset: u64) {
        self.define(
            name,
            SymbolPlacement::Section { section, offset },
            SymbolLinkage::Export,
        );
    }

    pub fn export_absolute(&mut self, name: &str, address: usize) {
        self.define(name, SymbolPlacement::Absolute(address), SymbolLinkage::Export);
    }

    pub fn local(&mut self, name: &str, section: usize, offset: u64) {
        self.define(
            name,
            SymbolPlacement::Section { section, offset },
            SymbolLinkage::Local,
        );
    }

    pub fn local_absolute(&mut self, name: &str, address: usize) {
        self.define(name, SymbolPlacement::Absolute(address), SymbolLinkage::Local);
    }

    pub fn relocate(&mut self, section: usize, offset: u64, name: &str, kind: RelocKind, addend: i64) {
        self.relocations.push(Relocation {
            section,
            offset,
            name: name.to_string(),
            kind,
            addend,
        });
    }

    pub fn add_initializer(&mut self, name: &str) {
        self.initializers.push(name.to_string());
    }

    pub fn add_finalizer(&mut self, name: &str) {
        self.finalizers.push(name.to_string());
    }

    pub(crate) fn exports(&self) -> impl Iterator<Item = &SymbolDef> {
        self.symbols
            .iter()
            .filter(|s| s.linkage == SymbolLinkage::Export)
    }
}
