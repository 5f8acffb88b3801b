//! Multi-script game-scripting host: many sandboxed RISC-V guest VMs,
//! forked from shared ELF images, cooperatively scheduled by one host
//! thread. See the module docs on [`script_instance`], [`machine`], and
//! [`remote_bridge`] for the execution core this crate exists to provide.

pub mod benchmark;
pub mod binary_store;
pub mod dyncall;
pub mod error;
pub mod function_group;
pub mod hashing;
pub mod host;
pub mod machine;
pub mod metrics;
pub mod page_table;
pub mod remote_bridge;
pub mod script_instance;
pub mod script_registry;
pub mod syscall_table;

pub use binary_store::{Binary, BinaryStore};
pub use dyncall::{
    DynArg, DynArgs, DynCallEntry, DynCallFlags, DynCallHandler, DynCallRegistry, DynCallSlot, Resolution,
};
pub use error::{ScriptError, ScriptResult};
pub use function_group::{FunctionGroup, GroupHandler, SyscallNumberPool};
pub use host::{Host, HostBuilder};
pub use machine::{GuestAddr, GuestMachine};
pub use metrics::Metrics;
pub use remote_bridge::RemoteCallBridge;
pub use script_instance::{CallTarget, ScriptInstance};
pub use script_registry::ScriptRegistry;
