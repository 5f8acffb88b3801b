//! Explicit shared-state context threaded into every component, replacing
//! the source's process-wide statics (dynamic-call registry, exit
//! callbacks, global settings map).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dyncall::{DynCallHandler, DynCallRegistry};
use crate::metrics::Metrics;
use crate::script_instance::ScriptInstance;

/// Callback invoked by the `game-exit` syscall. Returns `true` if it wants
/// to be the one that stops the VM (only the first such callback matters).
pub type ExitCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Non-owning pointer into a `ScriptRegistry`-owned `ScriptInstance`, used
/// only so `farcall`/`interrupt` (§4.7) can resolve a target hash to an
/// instance without `syscall_table` depending on `ScriptRegistry`
/// directly. Valid as long as the registry entry exists; `ScriptRegistry`
/// keeps instances boxed so this never dangles across a `HashMap` rehash.
#[derive(Clone, Copy)]
struct InstanceHandle(*mut ScriptInstance);

// SAFETY: single-threaded cooperative scheduler; only ever dereferenced
// from the thread driving the VMs, one at a time.
unsafe impl Send for InstanceHandle {}

/// Shared context: dynamic-call registry, process-wide settings, exit
/// hooks, and metrics. Constructed once per process and handed by
/// reference (or clone, since its fields are all cheaply shareable) to
/// `BinaryStore`, `ScriptRegistry`, and every `ScriptInstance`.
#[derive(Clone)]
pub struct Host {
    dyncalls: Arc<DynCallRegistry>,
    settings: Arc<Mutex<HashMap<String, u64>>>,
    exit_callbacks: Arc<Mutex<Vec<ExitCallback>>>,
    metrics: Metrics,
    instances: Arc<Mutex<HashMap<u32, InstanceHandle>>>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            dyncalls: Arc::new(DynCallRegistry::new()),
            settings: Arc::new(Mutex::new(HashMap::new())),
            exit_callbacks: Arc::new(Mutex::new(Vec::new())),
            metrics: Metrics::new(),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `instance`'s address under its hash so `farcall`/
    /// `interrupt` can resolve it from inside another instance's syscall
    /// dispatch. Called by `ScriptRegistry` once the instance is boxed
    /// (so its address is stable).
    pub fn register_instance(&self, hash: u32, instance: &mut ScriptInstance) {
        self.instances.lock().unwrap().insert(hash, InstanceHandle(instance as *mut _));
    }

    pub fn unregister_instance(&self, hash: u32) {
        self.instances.lock().unwrap().remove(&hash);
    }

    /// # Safety
    /// The returned pointer is only valid while the registry entry lives
    /// and must not be dereferenced while the same instance is already
    /// mutably borrowed elsewhere on this thread (it will be, briefly,
    /// during the remote-call bridge's own use of raw pointers).
    pub(crate) fn lookup_instance(&self, hash: u32) -> Option<*mut ScriptInstance> {
        self.instances.lock().unwrap().get(&hash).map(|h| h.0)
    }

    pub fn dyncalls(&self) -> &DynCallRegistry {
        &self.dyncalls
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn set_setting(&self, key: impl Into<String>, value: u64) {
        self.settings.lock().unwrap().insert(key.into(), value);
    }

    /// `game-setting` syscall: returns `{present, value}`.
    pub fn get_setting(&self, key: &str) -> (bool, u64) {
        match self.settings.lock().unwrap().get(key) {
            Some(v) => (true, *v),
            None => (false, 0),
        }
    }

    pub fn register_exit_callback(&self, callback: ExitCallback) {
        self.exit_callbacks.lock().unwrap().push(callback);
    }

    /// `game-exit` syscall: runs every registered callback, returns whether
    /// any of them requested the VM be stopped.
    pub fn invoke_exit_callbacks(&self) -> bool {
        self.exit_callbacks
            .lock()
            .unwrap()
            .iter()
            .any(|callback| callback())
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring a `Host`'s initial settings and dynamic-call
/// registrations before any `ScriptInstance` is created.
#[derive(Default)]
pub struct HostBuilder {
    settings: HashMap<String, u64>,
    dyncalls: Vec<(String, String, Option<DynCallHandler>)>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: u64) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_dyncall(
        mut self,
        name: impl Into<String>,
        definition: impl Into<String>,
        handler: DynCallHandler,
    ) -> Self {
        self.dyncalls.push((name.into(), definition.into(), Some(handler)));
        self
    }

    pub fn build(self) -> crate::error::ScriptResult<Host> {
        let host = Host::new();
        for (key, value) in self.settings {
            host.set_setting(key, value);
        }
        host.dyncalls().register_many(self.dyncalls)?;
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_roundtrip_present_and_absent() {
        let host = Host::new();
        host.set_setting("difficulty", 3);
        assert_eq!(host.get_setting("difficulty"), (true, 3));
        assert_eq!(host.get_setting("missing"), (false, 0));
    }

    #[test]
    fn exit_callbacks_run_all_and_report_any_true() {
        let host = Host::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        host.register_exit_callback(Arc::new(move || {
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
            false
        }));
        host.register_exit_callback(Arc::new(|| true));
        assert!(host.invoke_exit_callbacks());
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn builder_preregisters_settings_and_dyncalls() {
        let host = HostBuilder::new()
            .with_setting("seed", 42)
            .with_dyncall("f", "void f()", Arc::new(|_| Ok(0)))
            .build()
            .unwrap();
        assert_eq!(host.get_setting("seed"), (true, 42));
        assert_eq!(host.dyncalls().len(), 1);
    }
}
