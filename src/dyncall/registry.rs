//! Process-wide hashed-name dynamic-call registry.
//!
//! Owned by `Host` and shared (via `Arc`) across every `ScriptInstance`, in
//! place of the source's static map — see the `Host` design note on
//! replacing process-wide singletons with an explicit context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{ScriptError, ScriptResult};
use crate::script_instance::ScriptInstance;

/// A host-side dynamic-call handler. Receives the owning instance so it can
/// read argument registers or `dyn_args`, and returns the guest-visible
/// result value.
pub type DynCallHandler = Arc<dyn Fn(&mut ScriptInstance) -> ScriptResult<i64> + Send + Sync>;

#[derive(Clone)]
pub struct DynCallEntry {
    pub name: String,
    pub definition: String,
    pub handler: DynCallHandler,
}

impl fmt::Debug for DynCallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynCallEntry")
            .field("name", &self.name)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Outcome of a late-binding resolution attempt during indexed dispatch.
/// Kept as a tagged result rather than a thrown exception, per the
/// source's "Unimplemented-trap" control flow being an invariant
/// violation waiting to happen if left as catch-and-retry.
#[derive(Debug)]
pub enum Resolution {
    Resolved(DynCallEntry),
    StillMissing,
}

fn unimplemented_trap(name: String, hash: u32) -> DynCallHandler {
    Arc::new(move |_instance| Err(ScriptError::unknown_dynamic_call(name.clone(), hash)))
}

#[derive(Debug, Default)]
pub struct DynCallRegistry {
    entries: Mutex<HashMap<u32, DynCallEntry>>,
}

impl DynCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `definition`, hash it, and register `handler` under that
    /// hash. A `None` handler installs an "unimplemented-trap" stub that
    /// fails with `UnknownDynamicCall` if ever invoked.
    pub fn register(
        &self,
        name: impl Into<String>,
        definition: impl Into<String>,
        handler: Option<DynCallHandler>,
    ) -> ScriptResult<()> {
        let name = name.into();
        let definition = definition.into();
        let canonical = crate::hashing::single_spaced(&definition);
        let hash = crate::hashing::crc32(canonical.as_bytes());

        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&hash) {
            if existing.name != name {
                return Err(ScriptError::hash_collision(name, existing.name.clone(), hash));
            }
        }
        let handler = handler.unwrap_or_else(|| unimplemented_trap(name.clone(), hash));
        entries.insert(
            hash,
            DynCallEntry {
                name,
                definition: canonical,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_many(
        &self,
        calls: Vec<(String, String, Option<DynCallHandler>)>,
    ) -> ScriptResult<()> {
        for (name, definition, handler) in calls {
            self.register(name, definition, handler)?;
        }
        Ok(())
    }

    /// Erase the entry for `definition` and optionally re-register it with
    /// a fresh handler.
    pub fn reset(&self, definition: &str, handler: Option<DynCallHandler>) -> ScriptResult<()> {
        let canonical = crate::hashing::single_spaced(definition);
        let hash = crate::hashing::crc32(canonical.as_bytes());
        {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&hash);
        }
        if let Some(handler) = handler {
            self.register(canonical.clone(), canonical, Some(handler))?;
        }
        Ok(())
    }

    /// Hashed dispatch lookup: returns a clone of the matching entry so the
    /// caller can invoke it without holding the registry lock.
    pub fn get(&self, hash: u32) -> Option<DynCallEntry> {
        self.entries.lock().unwrap().get(&hash).cloned()
    }

    /// Late-binding lookup used by indexed dispatch when a table slot's
    /// cached stub reports it is still unresolved.
    pub fn resolve(&self, hash: u32) -> Resolution {
        match self.get(hash) {
            Some(entry) => Resolution::Resolved(entry),
            None => Resolution::StillMissing,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
