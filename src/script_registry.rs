//! §4.6 ScriptRegistry: name-indexed map of live instances, the entry
//! point for inter-machine lookup (`Host::lookup_instance` resolves
//! farcall/interrupt targets by hash against instances registered here).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::binary_store::Binary;
use crate::error::{ScriptError, ScriptResult};
use crate::hashing::crc32;
use crate::host::Host;
use crate::script_instance::ScriptInstance;

thread_local! {
    /// Lazily populated per-thread fork cache, keyed by the canonical
    /// instance's hash. Forks are independent of the registry's instance
    /// and never visible across threads (§4.6, §5) — worker threads doing
    /// parallel simulation get their own state without contending on the
    /// canonical instance.
    static THREAD_FORKS: RefCell<HashMap<u32, Box<ScriptInstance>>> = RefCell::new(HashMap::new());
}

/// Global name-indexed map of live `ScriptInstance`s. Instances are boxed
/// so their addresses are stable across `HashMap` rehashes, since `Host`
/// holds a raw, non-owning pointer to each one under its hash.
#[derive(Default)]
pub struct ScriptRegistry {
    host: Host,
    instances: HashMap<u32, Box<ScriptInstance>>,
}

impl ScriptRegistry {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            instances: HashMap::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Builds a fresh `ScriptInstance` from `binary`, boots it, and
    /// registers it under `name`'s hash for lookup by other instances.
    pub fn create(&mut self, binary: Arc<Binary>, name: impl Into<String>, debug: bool) -> ScriptResult<u32> {
        let name = name.into();
        let hash = crc32(name.as_bytes());
        if self.instances.contains_key(&hash) {
            return Err(ScriptError::hash_collision(name.clone(), name, hash));
        }
        let mut instance = Box::new(ScriptInstance::new(binary, name, self.host.clone(), debug)?);
        self.host.register_instance(hash, &mut instance);
        self.instances.insert(hash, instance);
        Ok(hash)
    }

    /// Returns `None` on miss, matching the distilled surface's `get(hash)`.
    pub fn get(&self, hash: u32) -> Option<&ScriptInstance> {
        self.instances.get(&hash).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, hash: u32) -> Option<&mut ScriptInstance> {
        self.instances.get_mut(&hash).map(|b| b.as_mut())
    }

    /// Like `get`, but raises `ScriptNotFound` with `name` attached, for
    /// callers that have a name rather than a hash in hand.
    pub fn get_by_name(&self, name: &str) -> ScriptResult<&ScriptInstance> {
        self.get(crc32(name.as_bytes()))
            .ok_or_else(|| ScriptError::ScriptNotFound(name.to_string()))
    }

    pub fn remove(&mut self, hash: u32) -> Option<Box<ScriptInstance>> {
        let removed = self.instances.remove(&hash);
        if removed.is_some() {
            self.host.unregister_instance(hash);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns the calling thread's own fork of the instance registered
    /// under `hash`, creating one on first request by re-booting `binary`
    /// under the same name. The fork shares `Host` (so the dynamic-call
    /// registry, settings, and metrics are still process-wide) but has its
    /// own VM state, entirely independent of both the canonical instance
    /// and any other thread's fork.
    pub fn thread_fork<F, R>(&self, hash: u32, binary: Arc<Binary>, debug: bool, f: F) -> ScriptResult<R>
    where
        F: FnOnce(&mut ScriptInstance) -> R,
    {
        let canonical_name = self
            .get(hash)
            .map(|i| i.name().to_string())
            .ok_or_else(|| ScriptError::ScriptNotFound(format!("<hash 0x{hash:08x}>")))?;

        THREAD_FORKS.with(|cache| -> ScriptResult<R> {
            let mut cache = cache.borrow_mut();
            if !cache.contains_key(&hash) {
                let forked = ScriptInstance::new(binary, canonical_name, self.host.clone(), debug)?;
                cache.insert(hash, Box::new(forked));
            }
            let instance = cache.get_mut(&hash).expect("just inserted");
            Ok(f(instance))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_registry_is_none() {
        let registry = ScriptRegistry::new(Host::new());
        assert!(registry.get(0xdead_beef).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn get_by_name_reports_script_not_found() {
        let registry = ScriptRegistry::new(Host::new());
        let err = registry.get_by_name("missing").unwrap_err();
        assert!(matches!(err, ScriptError::ScriptNotFound(name) if name == "missing"));
    }
}
