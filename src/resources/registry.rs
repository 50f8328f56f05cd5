//! Per-kind ownership of host objects that have been handed to the guest.
//!
//! The registry is the only owner of a captured object. Handle tables refer
//! to it by [`ResourceId`] and never hold the object itself.

use crate::error::TableError;
use crate::resources::ResourceId;
use std::any::Any;
use std::collections::HashMap;

/// Host objects of one resource kind that have been handed to the guest.
///
/// Each captured object gets a fresh [`ResourceId`] from a per-kind counter
/// and remembers the owning handle it was last published under, so handing
/// the same object out again reuses that handle instead of minting a new one.
#[derive(Default)]
pub struct CaptureRegistry {
    entries: HashMap<ResourceId, Capture>,
    next_rep: u32,
}

struct Capture {
    value: Box<dyn Any>,
    handle: Option<u32>,
}

impl CaptureRegistry {
    /// Creates an empty registry.
    pub fn new() -> CaptureRegistry {
        CaptureRegistry::default()
    }

    /// Takes ownership of `value` and assigns it a new representation.
    ///
    /// Representations are never reused, so this fails once the counter is
    /// exhausted.
    pub fn capture(&mut self, value: Box<dyn Any>) -> Result<ResourceId, TableError> {
        self.next_rep = self.next_rep.checked_add(1).ok_or(TableError::Full)?;
        let rep = ResourceId::from_u32(self.next_rep);
        self.entries.insert(rep, Capture {
            value,
            handle: None,
        });
        Ok(rep)
    }

    /// Whether `rep` names a live captured object.
    pub fn contains(&self, rep: ResourceId) -> bool {
        self.entries.contains_key(&rep)
    }

    /// The handle `rep` was last published under, if any.
    pub fn handle_of(&self, rep: ResourceId) -> Option<u32> {
        self.entries.get(&rep).and_then(|c| c.handle)
    }

    /// Records that `rep` is now reachable through `handle`.
    pub fn set_handle(&mut self, rep: ResourceId, handle: u32) -> Result<(), TableError> {
        let entry = self
            .entries
            .get_mut(&rep)
            .ok_or(TableError::NotCaptured(rep))?;
        entry.handle = Some(handle);
        Ok(())
    }

    /// Borrows the object behind `rep` as a `T`.
    pub fn get<T: Any>(&self, rep: ResourceId) -> Result<&T, TableError> {
        self.entries
            .get(&rep)
            .ok_or(TableError::NotCaptured(rep))?
            .value
            .downcast_ref()
            .ok_or(TableError::WrongType(rep))
    }

    /// Mutably borrows the object behind `rep` as a `T`.
    pub fn get_mut<T: Any>(&mut self, rep: ResourceId) -> Result<&mut T, TableError> {
        self.entries
            .get_mut(&rep)
            .ok_or(TableError::NotCaptured(rep))?
            .value
            .downcast_mut()
            .ok_or(TableError::WrongType(rep))
    }

    /// Removes `rep`, handing its object back to the caller.
    pub fn remove(&mut self, rep: ResourceId) -> Result<Box<dyn Any>, TableError> {
        self.entries
            .remove(&rep)
            .map(|c| c.value)
            .ok_or(TableError::NotCaptured(rep))
    }

    /// Number of live captured objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reps_are_never_reused() {
        let mut registry = CaptureRegistry::new();
        let a = registry.capture(Box::new("a")).unwrap();
        registry.remove(a).unwrap();
        let b = registry.capture(Box::new("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn exhausted_reps_are_an_error() {
        let mut registry = CaptureRegistry::new();
        registry.next_rep = u32::MAX - 1;
        let last = registry.capture(Box::new(1u8)).unwrap();
        assert_eq!(last, ResourceId::from_u32(u32::MAX));
        assert_eq!(registry.capture(Box::new(2u8)).err(), Some(TableError::Full));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get::<u8>(last), Ok(&1));
    }

    #[test]
    fn typed_access() {
        let mut registry = CaptureRegistry::new();
        let rep = registry.capture(Box::new(7u32)).unwrap();
        *registry.get_mut::<u32>(rep).unwrap() += 1;
        assert_eq!(*registry.get::<u32>(rep).unwrap(), 8);
        assert_eq!(registry.get::<String>(rep), Err(TableError::WrongType(rep)));
    }

    #[test]
    fn remembers_handle() {
        let mut registry = CaptureRegistry::new();
        let rep = registry.capture(Box::new(())).unwrap();
        assert_eq!(registry.handle_of(rep), None);
        registry.set_handle(rep, 3).unwrap();
        assert_eq!(registry.handle_of(rep), Some(3));
        let value = registry.remove(rep).unwrap();
        assert!(value.downcast::<()>().is_ok());
        assert_eq!(registry.remove(rep).err(), Some(TableError::NotCaptured(rep)));
        assert_eq!(registry.set_handle(rep, 4), Err(TableError::NotCaptured(rep)));
    }
}
