use crate::{Error, Result, engine::NAMESPACE_SEPARATOR};

/// Capacity of the local namespace registry.
pub(crate) const NS_TABLE_SIZE: usize = 1024;

/// Max combined length of a namespace name or tuple name.
pub(crate) const MAX_KEY_LEN: usize = 1023;

/// Local attach counts beyond this indicate a corrupted handle.
const REFCOUNT_LIMIT: u32 = 0xFFFE;

/// Handle of a locally attached namespace.
///
/// A generational index: the generation is sealed into the handle at
/// create/attach time, so a handle outliving its registry slot is detected
/// instead of silently addressing an unrelated namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

#[derive(Debug)]
struct NsEntry {
    name: String,
    refcount: u32,
    generation: u32,
}

/// Local name -> entry mapping with per-process reference counts; the
/// remote `refcnt` hash field tracks attachments across processes.
#[derive(Debug)]
pub(crate) struct NamespaceRegistry {
    entries: Vec<Option<NsEntry>>,
    next_generation: u32,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self {
            entries: (0..NS_TABLE_SIZE).map(|_| None).collect(),
            next_generation: 1,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<NsHandle> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            entry.as_ref().filter(|e| e.name == name).map(|e| NsHandle {
                index,
                generation: e.generation,
            })
        })
    }

    /// Registers a freshly created namespace with refcount 1.
    pub fn create(&mut self, name: &str) -> Result<NsHandle> {
        if self.lookup(name).is_some() {
            return Err(Error::Exists);
        }

        let index = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .ok_or_else(|| Error::Client("namespace table exhausted".to_owned()))?;

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        self.entries[index] = Some(NsEntry {
            name: name.to_owned(),
            refcount: 1,
            generation,
        });
        Ok(NsHandle { index, generation })
    }

    /// Bumps the local refcount of `name`, registering it on first attach.
    pub fn attach(&mut self, name: &str) -> Result<NsHandle> {
        match self.lookup(name) {
            Some(handle) => {
                self.bump(handle)?;
                Ok(handle)
            }
            None => self.create(name),
        }
    }

    /// Checks the generation seal and returns the namespace name.
    pub fn validate(&self, handle: NsHandle) -> Result<&str> {
        let entry = self
            .entries
            .get(handle.index)
            .and_then(|e| e.as_ref())
            .ok_or(Error::Handle)?;
        if entry.generation != handle.generation {
            return Err(Error::Handle);
        }
        if entry.refcount > REFCOUNT_LIMIT {
            return Err(Error::NsBusy);
        }
        Ok(&entry.name)
    }

    fn bump(&mut self, handle: NsHandle) -> Result<()> {
        self.validate(handle)?;
        let entry = self.entries[handle.index].as_mut().expect("validated");
        if entry.refcount >= REFCOUNT_LIMIT {
            return Err(Error::NsBusy);
        }
        entry.refcount += 1;
        Ok(())
    }

    /// Drops one local reference; the slot is reclaimed at zero and the
    /// generation retired, invalidating all outstanding handles.
    pub fn detach(&mut self, handle: NsHandle) -> Result<u32> {
        self.validate(handle)?;
        let entry = self.entries[handle.index].as_mut().expect("validated");
        entry.refcount -= 1;
        let remaining = entry.refcount;
        if remaining == 0 {
            self.entries[handle.index] = None;
        }
        Ok(remaining)
    }
}

/// Namespace and tuple names may not be empty, embed the `::` separator or
/// exceed the key length limit.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_KEY_LEN || name.contains(NAMESPACE_SEPARATOR) {
        return Err(Error::Invalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_lifecycle() {
        let mut registry = NamespaceRegistry::new();
        let handle = registry.create("NS1").unwrap();

        // k attaches, k + 1 detaches
        let k = 3;
        for _ in 0..k {
            assert_eq!(handle, registry.attach("NS1").unwrap());
        }
        for expected in (1..=k).rev() {
            assert_eq!(expected, registry.detach(handle).unwrap());
        }
        assert_eq!(0, registry.detach(handle).unwrap());

        // the handle is stale now
        assert!(matches!(registry.validate(handle), Err(Error::Handle)));
        assert!(registry.lookup("NS1").is_none());
    }

    #[test]
    fn stale_generation_detected() {
        let mut registry = NamespaceRegistry::new();
        let first = registry.create("NS1").unwrap();
        registry.detach(first).unwrap();

        // same slot, new generation
        let second = registry.create("NS2").unwrap();
        assert_eq!(first.index, second.index);
        assert!(matches!(registry.validate(first), Err(Error::Handle)));
        assert!(registry.validate(second).is_ok());
    }

    #[test]
    fn duplicate_create_rejected() {
        let mut registry = NamespaceRegistry::new();
        registry.create("NS1").unwrap();
        assert!(matches!(registry.create("NS1"), Err(Error::Exists)));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("tuples").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a::b").is_err());
        assert!(validate_name(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
