//! Dynamic-call dispatch: hashed lookup, indexed table dispatch with
//! late-binding, and typed variadic argument marshalling.

pub mod args;
pub mod flags;
pub mod registry;

pub use args::{DynArg, DynArgs};
pub use flags::DynCallFlags;
pub use registry::{DynCallEntry, DynCallHandler, DynCallRegistry, Resolution};

/// One resolved slot of a per-binary `dyncall_array`, built at boot time by
/// resolving the guest's `dyncall_table` against the process-wide registry.
#[derive(Clone)]
pub struct DynCallSlot {
    pub hash: u32,
    pub flags: DynCallFlags,
    pub entry: Option<DynCallEntry>,
}

impl DynCallSlot {
    pub fn unresolved(hash: u32, flags: DynCallFlags) -> Self {
        Self {
            hash,
            flags,
            entry: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.entry.is_some()
    }
}
