//! Error taxonomy for the scripting host.
//!
//! One enum covers every failure kind a `ScriptInstance`, the dynamic-call
//! registry, or the remote-call bridge can produce. Classification helpers
//! let callers decide recovery strategy without matching on every variant.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("binary '{0}' not found in store")]
    BinaryNotFound(String),

    #[error("binary '{0}' already registered")]
    BinaryAlreadyExists(String),

    #[error("script '{0}' not found in registry")]
    ScriptNotFound(String),

    #[error("symbol lookup failed: '{0}'")]
    LookupFailure(String),

    #[error("guest exception during call to {symbol} at 0x{address:x}: {detail}")]
    GuestException {
        symbol: String,
        address: u64,
        detail: String,
    },

    #[error("guest timed out calling {symbol} at 0x{address:x} (overrun #{overrun_count})")]
    GuestTimeout {
        symbol: String,
        address: u64,
        overrun_count: u32,
    },

    #[error("unknown dynamic call '{name}' (hash 0x{hash:08x})")]
    UnknownDynamicCall { name: String, hash: u32 },

    #[error(
        "dynamic call hash collision: '{new_name}' and '{existing_name}' both hash to 0x{hash:08x}"
    )]
    HashCollision {
        new_name: String,
        existing_name: String,
        hash: u32,
    },

    #[error("out of memory: requested page beyond memory_max ({memory_max} bytes)")]
    OutOfMemory { memory_max: u64 },

    #[error("execution space protection fault at 0x{address:x}")]
    ExecutionSpaceProtectionFault { address: u64 },

    #[error("malformed dyncall_table: {0}")]
    MalformedDynCallTable(String),

    #[error("dynamic argument type mismatch: expected {expected}, found {found}")]
    DynArgTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("underlying machine error: {0}")]
    Machine(#[from] ckb_vm::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn lookup_failure(name: impl Into<String>) -> Self {
        ScriptError::LookupFailure(name.into())
    }

    pub fn guest_timeout(symbol: impl Into<String>, address: u64, overrun_count: u32) -> Self {
        ScriptError::GuestTimeout {
            symbol: symbol.into(),
            address,
            overrun_count,
        }
    }

    pub fn unknown_dynamic_call(name: impl Into<String>, hash: u32) -> Self {
        ScriptError::UnknownDynamicCall {
            name: name.into(),
            hash,
        }
    }

    pub fn hash_collision(new_name: impl Into<String>, existing_name: impl Into<String>, hash: u32) -> Self {
        ScriptError::HashCollision {
            new_name: new_name.into(),
            existing_name: existing_name.into(),
            hash,
        }
    }

    /// Broad error family, useful for metrics bucketing.
    pub fn category(&self) -> &'static str {
        match self {
            ScriptError::BinaryNotFound(_)
            | ScriptError::BinaryAlreadyExists(_)
            | ScriptError::ScriptNotFound(_)
            | ScriptError::LookupFailure(_) => "lookup",
            ScriptError::GuestException { .. } => "guest_exception",
            ScriptError::GuestTimeout { .. } => "timeout",
            ScriptError::UnknownDynamicCall { .. } => "dyncall",
            ScriptError::HashCollision { .. } => "config",
            ScriptError::OutOfMemory { .. } => "resource",
            ScriptError::ExecutionSpaceProtectionFault { .. } => "fault",
            ScriptError::MalformedDynCallTable(_) => "config",
            ScriptError::DynArgTypeMismatch { .. } => "dyncall",
            ScriptError::Machine(_) => "machine",
            ScriptError::Io(_) => "io",
        }
    }

    /// Whether retrying the same call later has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScriptError::GuestTimeout { .. })
    }

    /// Whether the failure stems from exceeding a configured resource limit.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            ScriptError::OutOfMemory { .. } | ScriptError::GuestTimeout { .. }
        )
    }

    /// Whether the failure is caused by caller-supplied data rather than guest misbehavior.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ScriptError::BinaryNotFound(_)
                | ScriptError::BinaryAlreadyExists(_)
                | ScriptError::ScriptNotFound(_)
                | ScriptError::LookupFailure(_)
        )
    }

    /// Whether this error, once caught, should mark the owning instance `crashed`/faulted.
    pub fn should_fault(&self) -> bool {
        matches!(
            self,
            ScriptError::GuestException { .. }
                | ScriptError::OutOfMemory { .. }
                | ScriptError::ExecutionSpaceProtectionFault { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_variant_family() {
        let timeout = ScriptError::guest_timeout("tick", 0x1000, 3);
        assert!(timeout.is_retryable());
        assert!(timeout.is_resource_limit());
        assert!(!timeout.should_fault());

        let fault = ScriptError::ExecutionSpaceProtectionFault { address: 0x5000_1000 };
        assert!(fault.should_fault());
        assert!(!fault.is_retryable());

        let lookup = ScriptError::lookup_failure("MyFunc");
        assert!(lookup.is_user_error());
        assert_eq!(lookup.category(), "lookup");
    }

    #[test]
    fn hash_collision_carries_both_names() {
        let err = ScriptError::hash_collision("new_fn", "old_fn", 0xdead_beef);
        match err {
            ScriptError::HashCollision { new_name, existing_name, hash } => {
                assert_eq!(new_name, "new_fn");
                assert_eq!(existing_name, "old_fn");
                assert_eq!(hash, 0xdead_beef);
            }
            _ => panic!("wrong variant"),
        }
    }
}
