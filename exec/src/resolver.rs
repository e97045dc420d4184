use std::borrow::Cow;
use std::fmt;

use crate::{BinaryFormat, LookupError, SymbolHit, SymbolSource};

/// Address of a materialized symbol in the execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(usize);

impl Address {
    pub fn new(addr: usize) -> Self {
        Address(addr)
    }

    pub fn from_ptr<T>(p: *const T) -> Self {
        Address(p as usize)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolNameKind {
    /// Source-level name; target mangling rules apply before the search.
    Mangled,
    /// Already a linker-level name, searched verbatim.
    Raw,
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolRequest<'a> {
    pub name: &'a str,
    pub kind: SymbolNameKind,
}

/// Search the given scopes in order and return the first bound address.
/// A name that only ever turns up pending is reported as Unresolved, which
/// is distinct from NotFound: the symbol exists but its owning load has not
/// materialized it yet.
pub fn search(
    sources: &[&dyn SymbolSource],
    request: SymbolRequest<'_>,
    format: BinaryFormat,
) -> Result<Address, LookupError> {
    let linker_name: Cow<'_, str> = match request.kind {
        SymbolNameKind::Raw => Cow::Borrowed(request.name),
        SymbolNameKind::Mangled => format.mangle(request.name),
    };

    let mut pending = false;
    for source in sources {
        match source.find(&linker_name) {
            SymbolHit::Bound(addr) => {
                log::debug!("resolved {} in scope {}: {}", linker_name, source.scope_name(), addr);
                return Ok(addr);
            }
            SymbolHit::Pending => pending = true,
            SymbolHit::Missing => {}
        }
    }

    if pending {
        Err(LookupError::Unresolved(linker_name.into_owned()))
    } else {
        Err(LookupError::NotFound(linker_name.into_owned()))
    }
}
