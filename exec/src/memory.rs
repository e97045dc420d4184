use linked_list_allocator::Heap;
use memmap::MmapMut;
use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;

use crate::MapError;

/// Default size of the reserved address-space window. Keeping all mapped
/// code inside one bounded window keeps every block within 32-bit relative
/// addressing range of every other block.
pub const DEFAULT_RESERVATION: usize = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perm {
    Rw,
    Ro,
    Rx,
}

impl Perm {
    fn prot(&self) -> libc::c_int {
        match self {
            Perm::Rw => libc::PROT_READ | libc::PROT_WRITE,
            Perm::Ro => libc::PROT_READ,
            Perm::Rx => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// One page-aligned sub-region of the window. Created writable; sealed to
/// its final permissions once the linking layer has patched it.
#[derive(Debug)]
pub struct MappedBlock {
    name: String,
    p: NonNull<u8>,
    size: usize,
    layout: Layout,
    perm: Perm,
}

impl MappedBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.p.as_ptr() as *const u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mapped_size(&self) -> usize {
        self.layout.size()
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn copy(&mut self, buf: &[u8]) {
        assert!(buf.len() <= self.layout.size());
        unsafe {
            std::ptr::copy(buf.as_ptr(), self.p.as_ptr(), buf.len());
        }
    }
}

/// Placement seam between the linking layer and the execution target. The
/// in-process mapper places blocks into our own image; a mapper for a
/// controlled helper process would implement the same trait.
pub trait MemoryMapper {
    /// Hand out a zeroed writable block. `align` must be a power of two;
    /// blocks are page-granular so they can be sealed independently.
    fn allocate(&mut self, name: &str, size: usize, align: usize) -> Result<MappedBlock, MapError>;
    fn protect(&mut self, block: &mut MappedBlock, perm: Perm) -> Result<(), MapError>;
    fn release(&mut self, block: MappedBlock) -> Result<(), MapError>;
    fn used(&self) -> usize;
    /// Base address and length of the reserved window.
    fn window(&self) -> (usize, usize);
}

pub struct InProcessMapper {
    page_size: usize,
    m: MmapMut,
    heap: Heap,
}

impl InProcessMapper {
    pub fn reserve(bytes: usize) -> io::Result<Self> {
        let ps = page_size();
        let size = page_align(bytes.max(ps), ps);
        let m = MmapMut::map_anon(size)?;
        let mut heap = Heap::empty();

        unsafe {
            let ptr = m.as_ptr();
            log::debug!("executor window reserved: {:#08x}+{:x}", ptr as usize, size);
            heap.init(ptr as *mut u8, size);
        }

        Ok(Self {
            page_size: ps,
            m,
            heap,
        })
    }
}

impl MemoryMapper for InProcessMapper {
    fn allocate(&mut self, name: &str, size: usize, align: usize) -> Result<MappedBlock, MapError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(MapError::InvalidLayout { size, align });
        }
        let mapped = page_align(size, self.page_size);
        let align = align.max(self.page_size);
        let layout = Layout::from_size_align(mapped, align)
            .map_err(|_| MapError::InvalidLayout { size: mapped, align })?;
        match self.heap.allocate_first_fit(layout) {
            Ok(p) => {
                // the window recycles freed blocks, scrub stale bytes
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), 0, mapped);
                }
                log::debug!("alloc {}: {:#08x}+{:x}", name, p.as_ptr() as usize, mapped);
                Ok(MappedBlock {
                    name: name.to_string(),
                    p,
                    size,
                    layout,
                    perm: Perm::Rw,
                })
            }
            Err(_) => Err(MapError::OutOfMemory { requested: mapped }),
        }
    }

    fn protect(&mut self, block: &mut MappedBlock, perm: Perm) -> Result<(), MapError> {
        unsafe {
            log::debug!(
                "mprotect {}: {:#08x}+{:x}: {:?}",
                block.name,
                block.p.as_ptr() as usize,
                block.layout.size(),
                perm
            );
            if libc::mprotect(
                block.p.as_ptr() as *mut libc::c_void,
                block.layout.size(),
                perm.prot(),
            ) == 0
            {
                block.perm = perm;
                Ok(())
            } else {
                Err(MapError::Protect(io::Error::last_os_error()))
            }
        }
    }

    fn release(&mut self, mut block: MappedBlock) -> Result<(), MapError> {
        // the allocator writes free-list nodes into returned memory, and a
        // recycled block may be handed out as data, so it must go back
        // writable. A block we cannot unprotect is leaked, not freed.
        if block.perm != Perm::Rw {
            self.protect(&mut block, Perm::Rw)?;
        }
        log::debug!(
            "released {}: {:#08x}+{:x}",
            block.name,
            block.p.as_ptr() as usize,
            block.layout.size()
        );
        unsafe {
            self.heap.deallocate(block.p, block.layout);
        }
        Ok(())
    }

    fn used(&self) -> usize {
        self.heap.used()
    }

    fn window(&self) -> (usize, usize) {
        (self.m.as_ptr() as usize, self.m.len())
    }
}

fn page_align(n: usize, ps: usize) -> usize {
    (n + (ps - 1)) & !(ps - 1)
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
