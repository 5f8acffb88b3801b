//! Host callbacks materialized as directly callable guest instructions.
//!
//! Each group owns one 512-byte slot (64 entries × 8 bytes) in a dedicated
//! exec-only guest page. Installing a handler writes a two-instruction
//! stub (`li a7, N; ecall`) into the slot and registers a syscall number
//! `N` the instance's syscall table routes back here.

use std::collections::HashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::machine::{GuestCpu, GuestMachine, GROUP_AREA_BASE};

pub const GROUP_SIZE: u64 = 64;
pub const SLOT_BYTES: u64 = 8;
pub const GROUP_BYTES: u64 = GROUP_SIZE * SLOT_BYTES;

/// Encodes `li a7, imm; ecall` as two 32-bit little-endian words. `imm`
/// must fit in 12 bits (the host syscall-number free list is far smaller
/// than that, so this never truncates in practice).
pub(crate) fn encode_stub(imm: u32) -> [u8; 8] {
    const ADDI: u32 = 0b0010011;
    const ECALL: u32 = 0b1110011;
    const A7: u32 = 17;
    let li = ((imm & 0xfff) << 20) | (A7 << 7) | ADDI;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&li.to_le_bytes());
    out[4..8].copy_from_slice(&ECALL.to_le_bytes());
    out
}

/// Host-side callback bound to one function-group slot. Receives the
/// owning `GuestCpu` so it can read arguments and, if it wants to produce
/// a return value, write `a0` directly before returning.
pub type GroupHandler = std::sync::Arc<dyn Fn(&mut GuestCpu) -> ScriptResult<i64> + Send + Sync>;

/// A free-list-backed allocator for host syscall numbers, shared by every
/// `FunctionGroup` an instance owns so numbers are never double-issued.
#[derive(Debug, Default)]
pub struct SyscallNumberPool {
    next: u32,
    free: Vec<u32>,
}

impl SyscallNumberPool {
    pub fn starting_at(first: u32) -> Self {
        Self { next: first, free: Vec::new() }
    }

    pub fn allocate(&mut self) -> u32 {
        self.free.pop().unwrap_or_else(|| {
            let n = self.next;
            self.next += 1;
            n
        })
    }

    pub fn release(&mut self, number: u32) {
        self.free.push(number);
    }
}

/// One 64-entry block of guest-executable callback stubs.
pub struct FunctionGroup {
    index: u32,
    base: u64,
    handlers: HashMap<u32, (u32, GroupHandler)>,
}

impl FunctionGroup {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            base: GROUP_AREA_BASE + index as u64 * GROUP_BYTES,
            handlers: HashMap::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn slot_address(&self, slot: u32) -> u64 {
        self.base + slot as u64 * SLOT_BYTES
    }

    /// Allocates a host syscall number from `pool`, writes the stub at
    /// `slot`, and records `handler` so the instance's syscall table can
    /// route the allocated number back to it.
    pub fn install(
        &mut self,
        slot: u32,
        handler: GroupHandler,
        pool: &mut SyscallNumberPool,
        machine: &mut GuestMachine,
    ) -> ScriptResult<u32> {
        if slot as u64 >= GROUP_SIZE {
            return Err(ScriptError::LookupFailure(format!(
                "function group slot {slot} out of range"
            )));
        }
        let number = pool.allocate();
        let addr = self.slot_address(slot);
        machine.memory_mut().local_mut().write(addr, &encode_stub(number));
        self.handlers.insert(slot, (number, handler));
        log::debug!(
            "function group {}: installed slot {slot} at 0x{addr:x} as syscall {number}",
            self.index
        );
        Ok(number)
    }

    pub fn uninstall(&mut self, slot: u32, machine: &mut GuestMachine) {
        if let Some((_number, _)) = self.handlers.remove(&slot) {
            let addr = self.slot_address(slot);
            machine.memory_mut().local_mut().write(addr, &[0u8; 8]);
        }
    }

    /// PC-to-slot conversion used by the syscall dispatcher when a
    /// function-group stub traps: `slot = ((pc - base) / 8) mod 64`.
    pub fn slot_from_pc(&self, pc: u64) -> Option<u32> {
        if pc < self.base {
            return None;
        }
        let offset = pc - self.base;
        if offset >= GROUP_BYTES {
            return None;
        }
        Some(((offset / SLOT_BYTES) % GROUP_SIZE) as u32)
    }

    pub fn handler_for_slot(&self, slot: u32) -> Option<&GroupHandler> {
        self.handlers.get(&slot).map(|(_, handler)| handler)
    }

    /// Returns every host syscall number this group currently owns, for
    /// the destructor to hand back to the shared pool.
    pub fn owned_syscall_numbers(&self) -> Vec<u32> {
        self.handlers.values().map(|(number, _)| *number).collect()
    }

    pub fn release_all(&mut self, pool: &mut SyscallNumberPool) {
        for number in self.owned_syscall_numbers() {
            pool.release(number);
        }
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_conversion_round_trips() {
        let group = FunctionGroup::new(2);
        for slot in [0u32, 1, 63] {
            let addr = group.slot_address(slot);
            assert_eq!(group.slot_from_pc(addr), Some(slot));
        }
    }

    #[test]
    fn pc_outside_group_range_is_none() {
        let group = FunctionGroup::new(0);
        assert_eq!(group.slot_from_pc(GROUP_AREA_BASE + GROUP_BYTES), None);
        assert_eq!(group.slot_from_pc(GROUP_AREA_BASE - 8), None);
    }

    #[test]
    fn syscall_number_pool_reuses_released_numbers() {
        let mut pool = SyscallNumberPool::starting_at(600);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!((a, b), (600, 601));
        pool.release(a);
        assert_eq!(pool.allocate(), 600);
    }

    #[test]
    fn stub_encodes_li_a7_then_ecall() {
        let stub = encode_stub(42);
        let li = u32::from_le_bytes(stub[0..4].try_into().unwrap());
        let ecall = u32::from_le_bytes(stub[4..8].try_into().unwrap());
        assert_eq!(ecall, 0b1110011);
        assert_eq!((li >> 20) & 0xfff, 42);
    }
}
