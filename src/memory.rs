//! Access to guest linear memory, the guest allocator and resource state
//! during lifting and lowering.

use crate::error::DecodeError;
use crate::func::HostContext;
use crate::resources::ResourceState;
use anyhow::{Result, bail};

/// Everything the codec needs from the guest side of a call.
///
/// The wasmtime-backed implementation lives in the linker. [`VecGuest`] is an
/// in-process implementation over a plain byte vector, handy for exercising
/// operations without compiling a module.
pub trait GuestMemory {
    /// The guest's linear memory.
    fn memory(&self) -> Result<&[u8]>;

    /// The guest's linear memory, mutably.
    fn memory_mut(&mut self) -> Result<&mut [u8]>;

    /// Calls the guest's `cabi_realloc`-style allocator.
    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32>;

    /// Handle tables, capture registries and borrow scope.
    fn resources(&mut self) -> &mut ResourceState;
}

/// A [`GuestMemory`] which can also hand out the embedder's data to host
/// implementations.
pub trait GuestStore: GuestMemory {
    /// Embedder data passed to host implementations.
    type Data;

    /// Splits off the view given to host implementations.
    fn host(&mut self) -> HostContext<'_, Self::Data>;
}

/// Context for reading values out of the guest.
pub struct LiftContext<'a> {
    guest: &'a mut dyn GuestMemory,
}

impl<'a> LiftContext<'a> {
    pub fn new(guest: &'a mut dyn GuestMemory) -> LiftContext<'a> {
        LiftContext { guest }
    }

    /// Verifies that `len` bytes at `ptr` are in bounds and `ptr` is aligned
    /// to `align`.
    pub fn check(&self, what: &'static str, ptr: u32, len: u64, align: u32) -> Result<()> {
        check_range(self.guest.memory()?.len(), what, ptr, len, align)
    }

    /// Reads `N` bytes at `offset`.
    pub fn read<const N: usize>(&self, offset: u32) -> Result<[u8; N]> {
        let memory = self.guest.memory()?;
        let start = offset as usize;
        match memory.get(start..).and_then(|m| m.get(..N)) {
            Some(bytes) => Ok(bytes.try_into()?),
            None => bail!(DecodeError::OutOfBounds { what: "value" }),
        }
    }

    /// Copies `len` bytes starting at `ptr`.
    pub fn bytes(&self, what: &'static str, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.check(what, ptr, u64::from(len), 1)?;
        let memory = self.guest.memory()?;
        Ok(memory[ptr as usize..][..len as usize].to_vec())
    }

    pub fn resources(&mut self) -> &mut ResourceState {
        self.guest.resources()
    }
}

fn check_range(memory: usize, what: &'static str, ptr: u32, len: u64, align: u32) -> Result<()> {
    match u64::from(ptr).checked_add(len) {
        Some(end) if end <= memory as u64 => {}
        _ => bail!(DecodeError::OutOfBounds { what }),
    }
    if ptr % align != 0 {
        bail!(DecodeError::Misaligned { what, align });
    }
    Ok(())
}

/// Context for writing values into the guest.
pub struct LowerContext<'a> {
    guest: &'a mut dyn GuestMemory,
}

impl<'a> LowerContext<'a> {
    pub fn new(guest: &'a mut dyn GuestMemory) -> LowerContext<'a> {
        LowerContext { guest }
    }

    /// Allocates `new_size` bytes aligned to `align` in the guest.
    ///
    /// The returned pointer is checked for alignment and bounds.
    pub fn realloc(&mut self, old: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        let ptr = self.guest.realloc(old, old_size, align, new_size)?;
        if ptr % align != 0 {
            bail!(DecodeError::ReallocMisaligned { align });
        }
        let len = self.guest.memory()?.len() as u64;
        if u64::from(ptr) + u64::from(new_size) > len {
            bail!(DecodeError::ReallocOutOfBounds);
        }
        Ok(ptr)
    }

    /// Verifies that `len` bytes at `ptr` may be written and `ptr` is
    /// aligned to `align`.
    pub fn check(&self, what: &'static str, ptr: u32, len: u64, align: u32) -> Result<()> {
        check_range(self.guest.memory()?.len(), what, ptr, len, align)
    }

    /// Writes `bytes` at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let memory = self.guest.memory_mut()?;
        match memory
            .get_mut(offset as usize..)
            .and_then(|m| m.get_mut(..bytes.len()))
        {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                Ok(())
            }
            None => bail!(DecodeError::OutOfBounds { what: "store" }),
        }
    }

    pub fn resources(&mut self) -> &mut ResourceState {
        self.guest.resources()
    }
}

/// An in-process guest: a byte vector with a bump allocator.
pub struct VecGuest<T = ()> {
    memory: Vec<u8>,
    next: u32,
    resources: ResourceState,
    data: T,
}

impl<T> VecGuest<T> {
    /// Creates a guest with `size` bytes of zeroed memory. Allocation starts
    /// at offset 8 so that null is never handed out.
    pub fn new(size: usize, data: T) -> VecGuest<T> {
        VecGuest {
            memory: vec![0; size],
            next: 8,
            resources: ResourceState::new(),
            data,
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn state(&self) -> &ResourceState {
        &self.resources
    }

    pub fn bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Offset of the next allocation.
    pub fn watermark(&self) -> u32 {
        self.next
    }
}

impl<T> GuestMemory for VecGuest<T> {
    fn memory(&self) -> Result<&[u8]> {
        Ok(&self.memory)
    }

    fn memory_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.memory)
    }

    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        if old_ptr != 0 && new_size <= old_size {
            return Ok(old_ptr);
        }
        let ptr = crate::types::align_to(self.next, align);
        let end = ptr
            .checked_add(new_size)
            .filter(|end| *end as usize <= self.memory.len());
        let Some(end) = end else {
            bail!("guest out of memory allocating {new_size} bytes");
        };
        if old_ptr != 0 {
            self.memory
                .copy_within(old_ptr as usize..(old_ptr + old_size) as usize, ptr as usize);
        }
        self.next = end;
        Ok(ptr)
    }

    fn resources(&mut self) -> &mut ResourceState {
        &mut self.resources
    }
}

impl<T> GuestStore for VecGuest<T> {
    type Data = T;

    fn host(&mut self) -> HostContext<'_, T> {
        HostContext::new(&mut self.data, &mut self.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_respects_alignment() {
        let mut guest = VecGuest::new(64, ());
        let mut cx = LowerContext::new(&mut guest);
        let a = cx.realloc(0, 0, 1, 3).unwrap();
        let b = cx.realloc(0, 0, 8, 8).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 16);
        assert!(cx.realloc(0, 0, 4, 64).is_err());
    }

    #[test]
    fn reads_are_bounds_checked() {
        let mut guest = VecGuest::new(16, ());
        let mut cx = LowerContext::new(&mut guest);
        cx.write(12, &[1, 2, 3, 4]).unwrap();
        assert!(cx.write(13, &[1, 2, 3, 4]).is_err());

        let cx = LiftContext::new(&mut guest);
        assert_eq!(cx.read::<4>(12).unwrap(), [1, 2, 3, 4]);
        let err = cx.read::<4>(13).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DecodeError>(),
            Some(&DecodeError::OutOfBounds { what: "value" })
        );
        assert!(cx.check("list", 4, 8, 4).is_ok());
        assert!(cx.check("list", 2, 8, 4).is_err());
        assert!(cx.check("list", 12, u64::from(u32::MAX), 1).is_err());
    }
}
