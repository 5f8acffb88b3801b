//! A single forked VM: page-fault policy, heap bounds, dynamic-call table,
//! symbol cache, and budget counters, as described in §3/§4.2.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::binary_store::Binary;
use crate::dyncall::{DynArg, DynCallSlot};
use crate::error::{ScriptError, ScriptResult};
use crate::function_group::{encode_stub, FunctionGroup, GroupHandler, SyscallNumberPool};
use crate::hashing::crc32;
use crate::host::Host;
use crate::machine::{
    GuestAddr, GuestMachine, StepEvent, ARG_REGS, FLOAT_ARG_REGS, MAX_BOOT_INSTRUCTIONS,
    MAX_HEAP, MAX_INSTRUCTIONS, MAX_MEMORY, RA_REG, SHM_BASE, SHM_SIZE,
};
use crate::page_table::PageAttributes;
use crate::syscall_table::{self, DispatchOutcome, RETURN_TRAP};

/// Fixed low address of a single-instruction trampoline every call/preempt
/// points its return address at, so a guest `ret` from the called function
/// surfaces as an ordinary (synthetic) syscall rather than requiring us to
/// single-step decode `ret` ourselves.
pub const RETURN_TRAMPOLINE: GuestAddr = 0x3000;
pub const HEAP_BASE: GuestAddr = 0x1000_0000;

/// Where a `call`/`preempt` should resume execution.
pub enum CallTarget<'a> {
    Name(&'a str),
    Address(GuestAddr),
}

impl<'a> From<&'a str> for CallTarget<'a> {
    fn from(name: &'a str) -> Self {
        CallTarget::Name(name)
    }
}

impl From<GuestAddr> for CallTarget<'static> {
    fn from(address: GuestAddr) -> Self {
        CallTarget::Address(address)
    }
}

/// A very small bump/free-list allocator standing in for the source's
/// native arena allocator (an external collaborator per §1/§4.2 we don't
/// own); it's enough to give `guest_alloc`/`guest_free` real semantics
/// over our own `PageTable`-backed memory.
#[derive(Debug, Default)]
struct HeapAllocator {
    base: GuestAddr,
    next_free: GuestAddr,
    freed: Vec<(GuestAddr, u64)>,
}

impl HeapAllocator {
    fn new(base: GuestAddr) -> Self {
        Self { base, next_free: base, freed: Vec::new() }
    }

    fn alloc(&mut self, size: u64, align: u64) -> GuestAddr {
        if let Some(pos) = self.freed.iter().position(|(_, len)| *len >= size) {
            let (addr, _) = self.freed.remove(pos);
            return addr;
        }
        let aligned = (self.next_free + align - 1) / align * align;
        self.next_free = aligned + size;
        debug_assert!(
            self.next_free - self.base <= MAX_HEAP,
            "guest heap grew past MAX_HEAP"
        );
        aligned
    }

    fn free(&mut self, addr: GuestAddr, size: u64) {
        self.freed.push((addr, size));
    }

    /// Whether `addr` was handed out by this arena, i.e. falls within the
    /// range this instance has ever bumped its watermark over.
    fn owns(&self, addr: GuestAddr) -> bool {
        addr >= self.base && addr < self.next_free
    }
}

/// One forked VM. Never outlives the `Binary` it was built from (held via
/// `Arc`, so that's upheld structurally rather than by convention).
pub struct ScriptInstance {
    name: String,
    hash: u32,
    machine: GuestMachine,
    host: Host,
    #[allow(dead_code)]
    binary: Arc<Binary>,
    heap_area: GuestAddr,
    heap: HeapAllocator,
    public_api: HashMap<u32, GuestAddr>,
    lookup_cache: RefCell<HashMap<String, GuestAddr>>,
    dyncall_array: Vec<DynCallSlot>,
    /// Non-owning; valid only while a bridged call installed by
    /// `RemoteCallBridge` is on the stack. See the design note on
    /// pointer-graph links in DESIGN.md.
    remote_link: Option<*mut ScriptInstance>,
    remote_access_set: HashSet<GuestAddr>,
    tick_event: Option<GuestAddr>,
    tick_block_reason: Option<u32>,
    budget_overruns: u32,
    last_newline: bool,
    dyn_args: crate::dyncall::DynArgs,
    stdout_enabled: bool,
    crashed: bool,
    function_groups: Vec<FunctionGroup>,
    syscall_pool: SyscallNumberPool,
    /// Simplified cooperative-thread bookkeeping: reason -> count of
    /// threads currently blocked on it. Thread *execution* itself is
    /// `ckb-vm`'s concern (an external collaborator per §1); we only need
    /// to track enough to answer "how many are blocked on R" for tick
    /// dispatch and to recover from a timeout by switching back to main.
    blocked_on: HashMap<u32, u32>,
    non_main_active: bool,
    boot_return: i64,
    debug: bool,
}

// SAFETY: single-threaded cooperative scheduler; `remote_link` is only
// ever read/written from that one thread, and only for the duration of a
// bridged call installed and torn down by `RemoteCallBridge`.
unsafe impl Send for ScriptInstance {}

impl ScriptInstance {
    pub fn new(binary: Arc<Binary>, name: impl Into<String>, host: Host, debug: bool) -> ScriptResult<Self> {
        let name = name.into();
        let hash = crc32(name.as_bytes());

        let mut machine = GuestMachine::new(MAX_MEMORY, MAX_BOOT_INSTRUCTIONS);
        // Exec-only `li a7, RETURN_TRAP; ecall` trampoline; every
        // call/preempt points the guest's return address here so `ret`
        // surfaces as a synthetic, unambiguous syscall instead of us
        // single-stepping `ret` by hand.
        machine
            .memory_mut()
            .local_mut()
            .write(RETURN_TRAMPOLINE, &encode_stub(RETURN_TRAP as u32));

        let entry = machine.load_elf(&binary.bytes, &[Bytes::from(name.clone().into_bytes())])?;
        machine.set_pc(entry);
        // Boot is just a call into `entry` with nowhere real to return to,
        // so point `ra` at the trampoline the same way `run_call` does: a
        // plain `ret` out of entry (as opposed to an explicit `fast_exit`
        // ecall) surfaces as an ordinary trampoline return instead of
        // running off into whatever garbage `ra` held at reset.
        machine.cpu().set_reg(RA_REG, RETURN_TRAMPOLINE);

        let mut instance = Self {
            name,
            hash,
            machine,
            host,
            binary,
            heap_area: HEAP_BASE,
            heap: HeapAllocator::new(HEAP_BASE),
            public_api: HashMap::new(),
            lookup_cache: RefCell::new(HashMap::new()),
            dyncall_array: Vec::new(),
            remote_link: None,
            remote_access_set: HashSet::new(),
            tick_event: None,
            tick_block_reason: None,
            budget_overruns: 0,
            last_newline: true,
            dyn_args: crate::dyncall::DynArgs::new(),
            stdout_enabled: true,
            crashed: false,
            function_groups: Vec::new(),
            syscall_pool: SyscallNumberPool::starting_at(600),
            blocked_on: HashMap::new(),
            non_main_active: false,
            boot_return: 0,
            debug,
        };

        instance.resolve_public_api();
        instance.resolve_dyncall_table()?;

        // Boot: run from the ELF entry point up to MAX_BOOT_INSTRUCTIONS.
        // Exceptions and timeouts here are fatal to instantiation.
        instance.machine.set_max_cycles(MAX_BOOT_INSTRUCTIONS);
        match instance.drive()? {
            DriveResult::Returned(value) => instance.boot_return = value,
            DriveResult::TimedOut => {
                return Err(ScriptError::GuestTimeout {
                    symbol: "<boot>".into(),
                    address: instance.machine.pc(),
                    overrun_count: 0,
                })
            }
        }
        Ok(instance)
    }

    /// The value `entry` returned (or passed to `fast_exit`) during boot,
    /// e.g. a `main` that computes a startup status code (§8 "basic call").
    pub fn boot_return(&self) -> i64 {
        self.boot_return
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    pub fn budget_overruns(&self) -> u32 {
        self.budget_overruns
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn tick_event(&self) -> Option<GuestAddr> {
        self.tick_event
    }

    pub fn set_tick_event(&mut self, address: GuestAddr, reason: u32) {
        self.tick_event = Some(address);
        self.tick_block_reason = Some(reason);
    }

    pub fn remote_access_set(&self) -> &HashSet<GuestAddr> {
        &self.remote_access_set
    }

    pub fn remote_access_set_mut(&mut self) -> &mut HashSet<GuestAddr> {
        &mut self.remote_access_set
    }

    pub(crate) fn machine_mut(&mut self) -> &mut GuestMachine {
        &mut self.machine
    }

    pub(crate) fn machine(&self) -> &GuestMachine {
        &self.machine
    }

    pub(crate) fn set_remote_link(&mut self, link: Option<*mut ScriptInstance>) -> Option<*mut ScriptInstance> {
        std::mem::replace(&mut self.remote_link, link)
    }

    pub(crate) fn remote_link(&self) -> Option<*mut ScriptInstance> {
        self.remote_link
    }

    /// Builds `public_api` from the binary's manifest, resolving each
    /// manifest line's address against the ELF's own symbol table. A
    /// manifest entry whose name isn't in the ELF at all resolves to `0`
    /// (round-trip property 5 treats that as "not found" rather than a
    /// panic).
    fn resolve_public_api(&mut self) {
        for (hash, line) in &self.binary.symbols {
            let addr = self.binary.elf_symbols.get(line).copied().unwrap_or(0);
            self.public_api.entry(*hash).or_insert(addr);
        }
    }

    /// Reads `dyncall_table`: `u32 count` then `count` descriptors of
    /// `{strname_addr: u32, hash: u32, init_only: u8, client_only: u8,
    /// server_only: u8, reserved: u8}`. `count > 512` is rejected.
    ///
    /// `dyncall_table` is a required symbol (§6), not part of the optional
    /// public-API manifest, so it's resolved straight from the ELF's own
    /// symbol table rather than through `public_api`.
    fn resolve_dyncall_table(&mut self) -> ScriptResult<()> {
        let table_addr = match self.binary.elf_symbols.get("dyncall_table") {
            Some(addr) if *addr != 0 => *addr,
            _ => return Ok(()),
        };

        let mut count_bytes = [0u8; 4];
        if !self.machine.memory_mut().local().read(table_addr, &mut count_bytes) {
            return Ok(());
        }
        let count = u32::from_le_bytes(count_bytes);
        if count > 512 {
            return Err(ScriptError::MalformedDynCallTable(format!(
                "entry count {count} exceeds 512"
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let base = table_addr + 4 + i as u64 * 12;
            let mut buf = [0u8; 12];
            if !self.machine.memory_mut().local().read(base, &mut buf) {
                continue;
            }
            let strname_addr = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as u64;
            let hash = u32::from_le_bytes(buf[4..8].try_into().unwrap());
            let flags = crate::dyncall::DynCallFlags::from_table_bytes(buf[8], buf[9], buf[10]);
            let _ = strname_addr;
            entries.push(DynCallSlot::unresolved(hash, flags));
        }

        for slot in entries.iter_mut() {
            if let Some(entry) = self.host.dyncalls().get(slot.hash) {
                slot.entry = Some(entry);
            }
        }
        self.dyncall_array = entries;
        Ok(())
    }

    pub fn symbol_name(&self, address: GuestAddr) -> Option<&str> {
        self.binary
            .elf_symbols
            .iter()
            .find(|(_, addr)| **addr == address)
            .map(|(name, _)| name.as_str())
    }

    pub fn address_of(&self, name: &str) -> Option<GuestAddr> {
        if let Some(addr) = self.lookup_cache.borrow().get(name) {
            return Some(*addr);
        }
        let hash = crc32(name.as_bytes());
        let addr = *self.public_api.get(&hash)?;
        self.lookup_cache.borrow_mut().insert(name.to_string(), addr);
        Some(addr)
    }

    pub fn api_function_from_hash(&self, hash: u32) -> Option<GuestAddr> {
        self.public_api.get(&hash).copied()
    }

    pub fn guest_alloc(&mut self, bytes: u64) -> GuestAddr {
        self.heap.alloc(bytes, 1)
    }

    pub fn guest_alloc_sequential(&mut self, bytes: u64) -> GuestAddr {
        let rounded = (bytes + 7) / 8 * 8;
        self.heap.alloc(rounded, 8)
    }

    /// Frees `addr` in this instance's own arena, or, if it wasn't
    /// allocated here, retries on `remote_link`'s arena (§4.5 allocator
    /// bridging): a pointer handed across a bridged call is freed against
    /// whichever side actually owns it. A miss with no remote link is a
    /// no-op — there's nowhere else to retry.
    pub fn guest_free(&mut self, addr: GuestAddr, size: u64) {
        if self.heap.owns(addr) {
            self.heap.free(addr, size);
        } else {
            self.on_unknown_free(addr, size);
        }
    }

    fn on_unknown_free(&mut self, addr: GuestAddr, size: u64) {
        if let Some(link) = self.remote_link {
            // SAFETY: `remote_link` is only set while a bridged call from
            // that instance is on the stack (installed and torn down by
            // `RemoteCallBridge::dispatch`), so it's valid and not
            // otherwise mutably aliased from this thread.
            unsafe { (*link).guest_free(addr, size) };
        }
    }

    /// Reallocates `addr` in this instance's own arena, or retries on
    /// `remote_link`'s arena if it wasn't allocated here (§4.5, same
    /// bridging rule as `guest_free`). A miss with no remote link falls
    /// back to a fresh allocation, since there's no arena left to shrink or
    /// grow in place.
    pub fn guest_realloc(&mut self, addr: GuestAddr, old_size: u64, new_size: u64) -> GuestAddr {
        if self.heap.owns(addr) {
            self.heap.free(addr, old_size);
            self.heap.alloc(new_size, 1)
        } else {
            self.on_unknown_realloc(addr, old_size, new_size)
        }
    }

    fn on_unknown_realloc(&mut self, addr: GuestAddr, old_size: u64, new_size: u64) -> GuestAddr {
        match self.remote_link {
            // SAFETY: see `on_unknown_free`.
            Some(link) => unsafe { (*link).guest_realloc(addr, old_size, new_size) },
            None => self.heap.alloc(new_size, 1),
        }
    }

    pub fn heap_area(&self) -> GuestAddr {
        self.heap_area
    }

    pub fn dyncall_slot(&self, index: usize) -> Option<&DynCallSlot> {
        self.dyncall_array.get(index)
    }

    /// `[name] says: ...` prefix convention: only emitted at the start of
    /// a fresh line, so a multi-chunk `write` syscall from the guest reads
    /// as one continuous line.
    pub fn print(&mut self, text: &str) {
        if !self.stdout_enabled {
            return;
        }
        if self.last_newline {
            print!("[{}] says: ", self.name);
        }
        print!("{text}");
        self.last_newline = text.ends_with('\n');
    }

    pub fn set_stdout_enabled(&mut self, enabled: bool) {
        self.stdout_enabled = enabled;
    }

    pub fn shared_memory_range() -> (GuestAddr, GuestAddr) {
        (SHM_BASE, SHM_BASE + SHM_SIZE)
    }

    pub fn install_function_group_handler(
        &mut self,
        group_index: u32,
        slot: u32,
        handler: GroupHandler,
    ) -> ScriptResult<u32> {
        while self.function_groups.len() <= group_index as usize {
            let idx = self.function_groups.len() as u32;
            self.function_groups.push(FunctionGroup::new(idx));
        }
        let mut pool = std::mem::take(&mut self.syscall_pool);
        let result = self.function_groups[group_index as usize].install(
            slot,
            handler,
            &mut pool,
            &mut self.machine,
        );
        self.syscall_pool = pool;
        result
    }

    pub fn function_group_for_pc(&self, pc: GuestAddr) -> Option<(usize, u32)> {
        for (idx, group) in self.function_groups.iter().enumerate() {
            if let Some(slot) = group.slot_from_pc(pc) {
                return Some((idx, slot));
            }
        }
        None
    }

    pub fn function_groups(&self) -> &[FunctionGroup] {
        &self.function_groups
    }

    /// Counts threads blocked on `reason` and `preempt`s into `tick_event`.
    /// Asserts the main thread is current both before and after: tick
    /// dispatch must never clobber main registers.
    pub fn each_tick_event(&mut self) -> ScriptResult<()> {
        let (event, reason) = match (self.tick_event, self.tick_block_reason) {
            (Some(e), Some(r)) => (e, r),
            _ => return Ok(()),
        };
        debug_assert!(!self.non_main_active, "tick dispatch while a non-main thread is current");
        let count = *self.blocked_on.get(&reason).unwrap_or(&0);
        self.preempt(event.into(), &[count as i64, reason as i64])?;
        debug_assert!(!self.non_main_active, "tick dispatch left a non-main thread current");
        Ok(())
    }

    /// Resolves `target`, resets the per-call budget, and runs to
    /// completion (the trampoline return) or timeout.
    pub fn call(&mut self, target: CallTarget<'_>, args: &[i64]) -> ScriptResult<i64> {
        let address = self.resolve_target(target)?;
        self.run_call(address, args, MAX_INSTRUCTIONS)
    }

    /// Like `call`, but saves and restores every architectural register
    /// around the run, so re-entering the guest from a host callback
    /// never disturbs the interrupted computation (§8 property 2).
    pub fn preempt(&mut self, target: CallTarget<'_>, args: &[i64]) -> ScriptResult<i64> {
        let address = self.resolve_target(target)?;
        let saved = self.machine.registers();
        let saved_pc = self.machine.pc();
        // A preempted run is, from the main computation's point of view, a
        // non-main thread: if it times out, `recover_from_timeout` should
        // block it on its recorded reason instead of treating it as main
        // execution stalling.
        self.non_main_active = true;
        let result = self.run_call(address, args, MAX_INSTRUCTIONS);
        self.non_main_active = false;
        self.machine.restore_registers(&saved);
        self.machine.set_pc(saved_pc);
        result
    }

    /// Continues the current guest state for up to `cycles` instructions.
    /// Exceptions mark the instance `crashed` and do not propagate.
    pub fn resume(&mut self, cycles: u64) {
        self.machine.set_max_cycles(cycles);
        match self.drive() {
            Ok(_) => {}
            Err(err) => {
                log::error!("instance '{}' crashed during resume: {err}", self.name);
                self.crashed = true;
            }
        }
    }

    fn resolve_target(&self, target: CallTarget<'_>) -> ScriptResult<GuestAddr> {
        match target {
            CallTarget::Name(name) => self
                .address_of(name)
                .filter(|addr| *addr != 0)
                .ok_or_else(|| ScriptError::lookup_failure(name)),
            CallTarget::Address(addr) => Ok(addr),
        }
    }

    fn run_call(&mut self, address: GuestAddr, args: &[i64], budget: u64) -> ScriptResult<i64> {
        for (reg, value) in ARG_REGS.iter().zip(args.iter()) {
            self.machine.cpu().set_reg(*reg, *value as u64);
        }
        self.machine.cpu().set_reg(RA_REG, RETURN_TRAMPOLINE);
        self.machine.set_pc(address);
        // Resets the per-call instruction counter (§4.2): ckb-vm's cycles()
        // is cumulative, so without this a call's remaining headroom would
        // shrink across the life of the instance instead of resetting to a
        // full `budget` each time.
        self.machine.reset_cycles();
        self.machine.set_max_cycles(budget);

        let outcome = self.drive();
        self.host.metrics().record_instructions(self.machine.cycles());

        match outcome {
            Ok(DriveResult::Returned(value)) => Ok(value),
            Ok(DriveResult::TimedOut) => {
                self.budget_overruns += 1;
                self.host.metrics().record_budget_overrun();
                self.recover_from_timeout(self.tick_block_reason);
                log::warn!(
                    "instance '{}' timed out at 0x{:x} (overrun #{})",
                    self.name,
                    self.machine.pc(),
                    self.budget_overruns
                );
                Ok(-1)
            }
            Err(err) => {
                log::error!(
                    "instance '{}' guest exception calling 0x{address:x}: {err}",
                    self.name
                );
                self.host.metrics().record_fault();
                self.terminate_non_main_threads();
                Ok(-1)
            }
        }
    }

    fn recover_from_timeout(&mut self, reason: Option<u32>) {
        if self.non_main_active {
            if let Some(reason) = reason {
                *self.blocked_on.entry(reason).or_insert(0) += 1;
            }
            self.non_main_active = false;
        }
    }

    fn terminate_non_main_threads(&mut self) {
        self.non_main_active = false;
        self.blocked_on.clear();
    }

    /// Runs the machine until the return trampoline fires (a normal
    /// return), the guest invokes `fast_exit` directly, or the budget is
    /// exhausted. Every other `ecall` and both custom opcodes are handled
    /// inline without leaving this loop.
    fn drive(&mut self) -> ScriptResult<DriveResult> {
        loop {
            match self.machine.run()? {
                StepEvent::Halted(code) => return Ok(DriveResult::Returned(code)),
                StepEvent::BudgetExhausted => return Ok(DriveResult::TimedOut),
                StepEvent::CustomOpcode(instr) => {
                    self.handle_custom_opcode(instr)?;
                    let pc = self.machine.pc();
                    self.machine.set_pc(pc.wrapping_add(4));
                }
                StepEvent::Ecall { a7 } => {
                    if a7 == RETURN_TRAP {
                        let value = self.machine.cpu().reg(ARG_REGS[0]) as i64;
                        return Ok(DriveResult::Returned(value));
                    }
                    match syscall_table::dispatch(self, a7)? {
                        DispatchOutcome::Continue => {
                            let pc = self.machine.pc();
                            self.machine.set_pc(pc.wrapping_add(4));
                        }
                        DispatchOutcome::ShortCircuitReturn => {
                            let ra = self.machine.cpu().reg(RA_REG);
                            self.machine.set_pc(ra.wrapping_sub(4));
                        }
                    }
                }
            }
        }
    }

    fn handle_custom_opcode(&mut self, instr: crate::machine::CustomInstruction) -> ScriptResult<()> {
        use crate::machine::{OPCODE_DYNARG_PUSH, OPCODE_DYNCALL_INDEXED};
        match instr.opcode {
            OPCODE_DYNCALL_INDEXED => self.dispatch_indexed_dyncall(instr.imm as u32),
            OPCODE_DYNARG_PUSH => self.push_dynarg(instr.funct3, instr.rs1 as usize),
            _ => unreachable!("GuestMachine only surfaces our two opcodes"),
        }
    }

    /// Indexed dispatch with late binding: if the cached slot is still
    /// unresolved, consult the registry again before giving up.
    fn dispatch_indexed_dyncall(&mut self, index: u32) -> ScriptResult<()> {
        let (hash, cached) = {
            let slot = self
                .dyncall_array
                .get(index as usize)
                .ok_or_else(|| ScriptError::unknown_dynamic_call(format!("<index {index}>"), 0))?;
            (slot.hash, slot.entry.clone())
        };

        let entry = match cached {
            Some(entry) => entry,
            None => match self.host.dyncalls().resolve(hash) {
                crate::dyncall::Resolution::Resolved(entry) => {
                    self.dyncall_array[index as usize].entry = Some(entry.clone());
                    entry
                }
                crate::dyncall::Resolution::StillMissing => {
                    return Err(ScriptError::unknown_dynamic_call(format!("<index {index}>"), hash));
                }
            },
        };

        self.host.metrics().record_dyncall();
        let result = (entry.handler)(self)?;
        self.machine.cpu().set_reg(ARG_REGS[0], result as u64);
        Ok(())
    }

    fn push_dynarg(&mut self, funct3: u32, rs1: usize) -> ScriptResult<()> {
        let cpu = self.machine.cpu();
        let arg = match funct3 {
            0b000 => DynArg::I64(cpu.reg(rs1) as i32 as i64),
            0b001 => DynArg::I64(cpu.reg(ARG_REGS[0]) as i64),
            0b010 => DynArg::F32(f32::from_bits(cpu.reg(FLOAT_ARG_REGS[0]) as u32)),
            0b111 => {
                let addr = cpu.reg(ARG_REGS[0]);
                drop(cpu);
                DynArg::Str(self.read_c_string(addr))
            }
            other => {
                return Err(ScriptError::MalformedDynCallTable(format!(
                    "unknown dynarg funct3 {other}"
                )))
            }
        };
        self.dyn_args_mut().push(arg);
        Ok(())
    }

    pub fn dyn_args(&self) -> &crate::dyncall::DynArgs {
        &self.dyn_args
    }

    pub(crate) fn dyn_args_mut(&mut self) -> &mut crate::dyncall::DynArgs {
        &mut self.dyn_args
    }

    pub(crate) fn clear_dyn_args(&mut self) {
        self.dyn_args.clear();
    }

    fn read_c_string(&mut self, addr: GuestAddr) -> String {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            let mut byte = [0u8; 1];
            if !self.machine.memory_mut().local().read(cursor, &mut byte) || byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
            cursor += 1;
            if bytes.len() > 4096 {
                break;
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

use ckb_vm::Bytes;

enum DriveResult {
    Returned(i64),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_store::BinaryStore;

    // `li a0, 666; ret`, same minimal hand-assembled image the integration
    // tests boot, kept local here since `tests/` is a separate crate and
    // can't reach `machine()` (`pub(crate)`).
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

    fn booted(name: &str) -> ScriptInstance {
        let mut store = BinaryStore::new();
        store.insert(name, RETURNS_666_ELF.to_vec(), Vec::new()).unwrap();
        let binary = store.get(name).unwrap();
        ScriptInstance::new(binary, name, Host::new(), false).unwrap()
    }

    #[test]
    fn boot_captures_the_entry_point_return_value() {
        assert_eq!(booted("a").boot_return(), 666);
    }

    #[test]
    fn preempt_leaves_architectural_registers_unchanged() {
        let mut instance = booted("b");
        let before = instance.machine().registers();
        let result = instance.preempt(CallTarget::Address(RETURNS_666_ENTRY), &[]).unwrap();
        assert_eq!(result, 666);
        assert_eq!(instance.machine().registers(), before);
    }

    #[test]
    fn call_by_name_with_empty_manifest_is_a_lookup_failure() {
        let mut instance = booted("c");
        let err = instance.call(CallTarget::Name("main"), &[]).unwrap_err();
        assert!(matches!(err, ScriptError::LookupFailure(_)));
    }

    #[test]
    fn repeated_calls_do_not_accumulate_cycles_across_calls() {
        // Regression test: without resetting `cycles()` per call, this
        // instruction counter keeps growing call over call until an
        // unrelated later call spuriously times out against `MAX_INSTRUCTIONS`.
        let mut instance = booted("d");
        for _ in 0..5 {
            let result = instance.call(CallTarget::Address(RETURNS_666_ENTRY), &[]).unwrap();
            assert_eq!(result, 666);
        }
        assert!(instance.machine().cycles() < 10, "cycles should reflect only the last call");
        assert_eq!(instance.budget_overruns(), 0);
    }

    #[test]
    fn guest_free_retries_on_remote_link_for_a_foreign_address() {
        let mut a = booted("alloc_a");
        let mut b = booted("alloc_b");
        let b_addr = b.guest_alloc(16);
        assert!(!a.heap.owns(b_addr));

        // SAFETY: both instances are local to this test and outlive the
        // link, mirroring how `RemoteCallBridge` installs and tears down
        // `remote_link` around one bridged call.
        a.set_remote_link(Some(&mut b as *mut ScriptInstance));
        a.guest_free(b_addr, 16);
        a.set_remote_link(None);

        assert!(b.heap.freed.iter().any(|(addr, size)| *addr == b_addr && *size == 16));
    }

    #[test]
    fn guest_free_is_a_no_op_for_a_foreign_address_with_no_remote_link() {
        let mut a = booted("alloc_c");
        let b = booted("alloc_d");
        // `b`'s heap base, never allocated by `a`.
        a.guest_free(b.heap_area(), 16);
        assert!(a.heap.freed.is_empty());
    }
}
