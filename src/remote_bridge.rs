//! §4.5 RemoteCallBridge: splices two VMs' page tables together for the
//! duration of one call so a guest jump from one instance's code into
//! another's image space sees transparent reads and writes across both.
//!
//! The splice itself is `BridgeMemory`'s job (`crate::machine`); this
//! module only orchestrates which half of the address space each side
//! intercepts, copies the float argument registers `call`/`preempt` don't
//! already handle, and guarantees restoration on every exit path via a
//! scoped guard.

use crate::error::{ScriptError, ScriptResult};
use crate::machine::{GuestAddr, FLOAT_ARG_REGS};
use crate::page_table::PageTable;
use crate::script_instance::{CallTarget, ScriptInstance};

/// Swaps `callee`'s page-table bridge (and, in lenient mode, its
/// `remote_link` back-link) in on construction and restores both
/// unconditionally on `Drop` — so a guest exception unwinding through the
/// bridged call still leaves both VMs' handler state correct (§4.5).
struct BridgeGuard<'a> {
    callee: &'a mut ScriptInstance,
    previous_table_bridge: Option<*mut PageTable>,
    previous_remote_link: Option<*mut ScriptInstance>,
    touched_remote_link: bool,
}

impl<'a> BridgeGuard<'a> {
    fn install(
        caller_table: *mut PageTable,
        caller_ptr: *mut ScriptInstance,
        callee: &'a mut ScriptInstance,
        back_link: bool,
    ) -> Self {
        // SAFETY: `caller_table` outlives this guard (it belongs to the
        // caller, which is on the stack for the whole bridged call) and is
        // not otherwise mutably aliased while the bridge is installed.
        let previous_table_bridge =
            unsafe { callee.machine_mut().memory_mut().install_low_bridge(caller_table) };
        let previous_remote_link = if back_link {
            Some(callee.set_remote_link(Some(caller_ptr)))
        } else {
            None
        };
        Self {
            callee,
            previous_table_bridge,
            previous_remote_link: previous_remote_link.flatten(),
            touched_remote_link: back_link,
        }
    }
}

impl<'a> Drop for BridgeGuard<'a> {
    fn drop(&mut self) {
        self.callee
            .machine_mut()
            .memory_mut()
            .clear_bridge(self.previous_table_bridge);
        if self.touched_remote_link {
            self.callee.set_remote_link(self.previous_remote_link);
        }
    }
}

/// Orchestrates one bridged call. Stateless: every bridged call installs
/// and tears down its own splice, so there's nothing to construct.
pub struct RemoteCallBridge;

impl RemoteCallBridge {
    /// Lenient link (`a → b`): bridges `callee`'s below-`REMOTE_IMG_BASE`
    /// addresses to `caller`'s table and installs a temporary back-link so
    /// a re-entrant jump from `callee` toward low addresses lands back in
    /// `caller`. `address` is an address in `callee`'s own image.
    pub fn call(
        caller: &mut ScriptInstance,
        callee: &mut ScriptInstance,
        address: GuestAddr,
        args: &[i64],
    ) -> ScriptResult<i64> {
        Self::dispatch(caller, callee, address, args, true)
    }

    /// Strict link (`a → b`): same bridging, but `address` must already be
    /// present in `callee.remote_access_set()` — checked against every
    /// jump through a strict link, not only ones past `REMOTE_IMG_BASE`
    /// (the conservative reading, see §9). No back-link is installed, so
    /// `callee` cannot call back into `caller`.
    pub fn strict_call(
        caller: &mut ScriptInstance,
        callee: &mut ScriptInstance,
        address: GuestAddr,
        args: &[i64],
    ) -> ScriptResult<i64> {
        if !callee.remote_access_set().contains(&address) {
            return Err(ScriptError::ExecutionSpaceProtectionFault { address });
        }
        Self::dispatch(caller, callee, address, args, false)
    }

    fn dispatch(
        caller: &mut ScriptInstance,
        callee: &mut ScriptInstance,
        address: GuestAddr,
        args: &[i64],
        back_link: bool,
    ) -> ScriptResult<i64> {
        // `call`/`preempt` already shuffle the integer argument registers
        // from `args`; only the four float argument registers need an
        // explicit copy here.
        let float_regs: [u64; 4] = {
            let cpu = caller.machine_mut().cpu();
            std::array::from_fn(|i| cpu.reg(FLOAT_ARG_REGS[i]))
        };
        {
            let mut cpu = callee.machine_mut().cpu();
            for (reg, value) in FLOAT_ARG_REGS.iter().zip(float_regs.iter()) {
                cpu.set_reg(*reg, *value);
            }
        }

        let caller_table: *mut PageTable = caller.machine_mut().memory_mut().local_mut();
        let caller_ptr: *mut ScriptInstance = caller as *mut ScriptInstance;

        let result = {
            let guard = BridgeGuard::install(caller_table, caller_ptr, callee, back_link);
            guard.callee.preempt(CallTarget::Address(address), args)
        };
        // `preempt`'s own `run_call` resets the callee's cycle counter
        // before running, so `cycles()` here is already just this call's
        // consumption — no "before" snapshot needed (and taking one would
        // be wrong: it'd be overwritten by that reset anyway).
        let consumed = callee.machine().cycles();

        // Budget monotonicity (§8 property 4): the caller is charged at
        // least what the callee spent, so a bridged call can't be used to
        // launder instruction budget. Discount against the caller's real
        // remaining ceiling (`max_cycles`), not its cumulative `cycles()`
        // (which is per-call, reset at the start of its own `run_call`).
        let caller_max = caller.machine().max_cycles();
        let caller_used = caller.machine().cycles();
        caller
            .machine_mut()
            .set_max_cycles(caller_max.saturating_sub(consumed).max(caller_used));

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_store::BinaryStore;
    use crate::host::Host;

    // `li a0, 666; ret`, the same minimal hand-assembled image used by
    // `script_instance`'s own tests; duplicated locally since `tests/` is a
    // separate crate and can't reach `machine()`/`remote_access_set_mut()`.
    const RETURNS_666_ELF: &[u8] = &[
        0x7f, 0x45, 0x4c, 0x46, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
        0xf3, 0x00, 0x01, 0x00, 0x00, 0x00, 0x78, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00,
        0x38, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
        0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x13, 0x05, 0xa0, 0x29, 0x67, 0x80,
        0x00, 0x00,
    ];
    const RETURNS_666_ENTRY: GuestAddr = 0x10078;

    fn booted(name: &str, host: Host) -> ScriptInstance {
        let mut store = BinaryStore::new();
        store.insert(name, RETURNS_666_ELF.to_vec(), Vec::new()).unwrap();
        let binary = store.get(name).unwrap();
        ScriptInstance::new(binary, name, host, false).unwrap()
    }

    #[test]
    fn strict_call_rejects_address_outside_allow_list() {
        let host = Host::new();
        let mut caller = booted("caller", host.clone());
        let mut callee = booted("callee", host);
        let err = RemoteCallBridge::strict_call(&mut caller, &mut callee, RETURNS_666_ENTRY, &[]).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::ExecutionSpaceProtectionFault { address } if address == RETURNS_666_ENTRY
        ));
    }

    #[test]
    fn strict_call_succeeds_once_address_is_allow_listed() {
        let host = Host::new();
        let mut caller = booted("caller2", host.clone());
        let mut callee = booted("callee2", host);
        callee.remote_access_set_mut().insert(RETURNS_666_ENTRY);
        let result =
            RemoteCallBridge::strict_call(&mut caller, &mut callee, RETURNS_666_ENTRY, &[]).unwrap();
        assert_eq!(result, 666);
    }
}
