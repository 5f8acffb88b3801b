//! Adapter around the underlying RISC-V emulator.
//!
//! The decoder, execute loop, and arena allocator are an external
//! collaborator (`ckb-vm`); this module is the seam. It owns:
//!
//! - [`GuestMachine`], a thin wrapper around `ckb_vm`'s `DefaultMachine`
//!   parameterized over [`BridgeMemory`], our own page-table-backed
//!   `Memory` implementation (ckb-vm's stock memory types don't expose the
//!   page-fault/read-handler swap seam the remote-call bridge needs, so we
//!   supply our own and let `ckb-vm` drive decode/execute over it).
//! - Interception of the two custom opcodes (`0b1011011` dyncall-index,
//!   `0b0001011` dynarg-push) ahead of `ckb-vm`'s own step, mirroring the
//!   source's "unimplemented-instruction hook" being the only place these
//!   ever surface.

use ckb_vm::memory::Memory as CkbMemory;
use ckb_vm::registers::{A0, A7, RA, T0, T1};
use ckb_vm::{
    Bytes, DefaultCoreMachine, DefaultMachine, DefaultMachineBuilder, Error as CkbError,
    Register, SupportMachine, ISA_IMC,
};

use crate::error::{ScriptError, ScriptResult};
use crate::page_table::{page_of, Page, PageAttributes, PageTable, PAGE_SIZE};

pub type GuestAddr = u64;

pub const MAX_MEMORY: u64 = 16 * 1024 * 1024;
pub const MAX_HEAP: u64 = 256 * 1024 * 1024;
pub const MAX_INSTRUCTIONS: u64 = 8_000_000;
pub const MAX_BOOT_INSTRUCTIONS: u64 = 64_000_000;
pub const REMOTE_IMG_BASE: GuestAddr = 0x5000_0000;
pub const SHM_BASE: GuestAddr = 0x2000;
pub const SHM_SIZE: GuestAddr = 2 * PAGE_SIZE;
pub const GROUP_AREA_BASE: GuestAddr = 0x4000_0000;

/// Opcode of the indexed dyncall custom instruction (I-type, imm = table index).
pub const OPCODE_DYNCALL_INDEXED: u32 = 0b1011011;
/// Opcode of the dynarg-push custom instruction (I-type, funct3 = arg kind).
pub const OPCODE_DYNARG_PUSH: u32 = 0b0001011;

/// Decoded fields of one of our two custom instructions (shared I-type shape).
#[derive(Debug, Clone, Copy)]
pub struct CustomInstruction {
    pub opcode: u32,
    pub funct3: u32,
    pub rs1: u32,
    pub imm: i32,
}

pub fn decode_custom(word: u32) -> CustomInstruction {
    CustomInstruction {
        opcode: word & 0x7f,
        funct3: (word >> 12) & 0x7,
        rs1: (word >> 15) & 0x1f,
        imm: (word as i32) >> 20,
    }
}

/// Page-table-backed `Memory` for `ckb-vm`, with remote-call bridging.
///
/// Addresses below [`REMOTE_IMG_BASE`] are "local image"; at or above it is
/// "remote image". When `bridge` is set, accesses to the *other* VM's
/// address range are redirected to that VM's own `PageTable` rather than
/// this one's, for the lifetime of one bridged call.
pub struct BridgeMemory {
    local: PageTable,
    /// Raw pointer to the linked VM's page table, installed only for the
    /// duration of a bridged call and cleared by the scoped guard in
    /// `remote_bridge` on every exit path, including unwinding. Never
    /// dereferenced outside that window.
    bridge: Option<*mut PageTable>,
    /// Which half of the address space `bridge` intercepts. A caller
    /// bridging *into* a callee's image intercepts addresses at or above
    /// `REMOTE_IMG_BASE` (the caller's own low addresses stay local); the
    /// callee's back-link, set up for the duration of the same call,
    /// intercepts addresses *below* `REMOTE_IMG_BASE` instead, so the
    /// callee's own "local image" numbering resolves against the caller.
    bridge_intercepts_low: bool,
    memory_max: u64,
}

// SAFETY: `BridgeMemory` is only ever accessed from the single thread
// driving the cooperative VM scheduler; the raw pointer exists purely to
// let two `GuestMachine`s alias each other's page table for one call.
unsafe impl Send for BridgeMemory {}

impl BridgeMemory {
    pub fn new(memory_max: u64) -> Self {
        Self {
            local: PageTable::new(memory_max),
            bridge: None,
            bridge_intercepts_low: false,
            memory_max,
        }
    }

    pub fn local(&self) -> &PageTable {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut PageTable {
        &mut self.local
    }

    /// Installs a bridge to another VM's page table, intercepting
    /// addresses at or above `REMOTE_IMG_BASE` (the direction a caller
    /// uses to jump into a callee's image). Returns the previous bridge
    /// (if any) so a guard can restore it.
    ///
    /// # Safety
    /// `other` must remain valid and unaliased as `&mut` for as long as the
    /// bridge is installed.
    pub unsafe fn install_bridge(&mut self, other: *mut PageTable) -> Option<*mut PageTable> {
        self.bridge_intercepts_low = false;
        self.bridge.replace(other)
    }

    /// Installs a bridge intercepting addresses *below* `REMOTE_IMG_BASE`
    /// instead — the back-link direction, used so a callee's own
    /// low-numbered addresses resolve against the caller that bridged
    /// into it for the duration of one call.
    ///
    /// # Safety
    /// Same as [`install_bridge`](Self::install_bridge).
    pub unsafe fn install_low_bridge(&mut self, other: *mut PageTable) -> Option<*mut PageTable> {
        self.bridge_intercepts_low = true;
        self.bridge.replace(other)
    }

    pub fn clear_bridge(&mut self, previous: Option<*mut PageTable>) {
        self.bridge = previous;
        self.bridge_intercepts_low = false;
    }

    fn table_for(&mut self, addr: GuestAddr) -> &mut PageTable {
        let redirect = match self.bridge {
            Some(_) if self.bridge_intercepts_low => addr < REMOTE_IMG_BASE,
            Some(_) => addr >= REMOTE_IMG_BASE,
            None => false,
        };
        if redirect {
            if let Some(ptr) = self.bridge {
                // SAFETY: see `install_bridge`.
                return unsafe { &mut *ptr };
            }
        }
        &mut self.local
    }

    fn shared_memory_hit(&self, addr: GuestAddr, len: u64) -> bool {
        addr >= SHM_BASE && addr + len <= SHM_BASE + SHM_SIZE
    }

    fn read_bytes(&mut self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), CkbError> {
        let table = self.table_for(addr);
        if table.read(addr, buf) {
            return Ok(());
        }
        // Fault: allocate on demand within capacity, else it's out-of-memory.
        let pageno = page_of(addr);
        if table.get_or_create(pageno, PageAttributes::RW).is_some() {
            table.read(addr, buf);
            return Ok(());
        }
        Err(CkbError::MemOutOfBound)
    }

    fn write_bytes(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), CkbError> {
        let table = self.table_for(addr);
        if table.write(addr, data) {
            return Ok(());
        }
        Err(CkbError::MemOutOfBound)
    }
}

impl<R: Register> CkbMemory for BridgeMemory {
    type REG = R;

    fn memory_size(&self) -> usize {
        self.memory_max as usize
    }

    fn load8(&mut self, addr: &R) -> Result<R, CkbError> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr.to_u64(), &mut buf)?;
        Ok(R::from_u8(buf[0]))
    }

    fn load16(&mut self, addr: &R) -> Result<R, CkbError> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr.to_u64(), &mut buf)?;
        Ok(R::from_u16(u16::from_le_bytes(buf)))
    }

    fn load32(&mut self, addr: &R) -> Result<R, CkbError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr.to_u64(), &mut buf)?;
        Ok(R::from_u32(u32::from_le_bytes(buf)))
    }

    fn load64(&mut self, addr: &R) -> Result<R, CkbError> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr.to_u64(), &mut buf)?;
        Ok(R::from_u64(u64::from_le_bytes(buf)))
    }

    fn store8(&mut self, addr: &R, value: &R) -> Result<(), CkbError> {
        self.write_bytes(addr.to_u64(), &[value.to_u8()])
    }

    fn store16(&mut self, addr: &R, value: &R) -> Result<(), CkbError> {
        self.write_bytes(addr.to_u64(), &value.to_u16().to_le_bytes())
    }

    fn store32(&mut self, addr: &R, value: &R) -> Result<(), CkbError> {
        self.write_bytes(addr.to_u64(), &value.to_u32().to_le_bytes())
    }

    fn store64(&mut self, addr: &R, value: &R) -> Result<(), CkbError> {
        self.write_bytes(addr.to_u64(), &value.to_u64().to_le_bytes())
    }

    fn execute_load16(&mut self, addr: u64) -> Result<u16, CkbError> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn execute_load32(&mut self, addr: u64) -> Result<u32, CkbError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn load_bytes(&mut self, addr: u64, size: u64) -> Result<Bytes, CkbError> {
        let mut buf = vec![0u8; size as usize];
        self.read_bytes(addr, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn store_bytes(&mut self, addr: u64, value: &[u8]) -> Result<(), CkbError> {
        self.write_bytes(addr, value)
    }
}

/// A syscall handler invoked from within a running `GuestMachine`. Kept
/// generic here; `ScriptInstance` supplies the real dispatch table.
pub trait HostSyscalls {
    fn ecall(&mut self, cpu: &mut GuestCpu) -> ScriptResult<()>;
}

/// Register/PC access surface handed to syscall handlers and custom-opcode
/// handlers, independent of `ckb-vm`'s own machine type so callers outside
/// this module never need to name it.
pub struct GuestCpu<'a> {
    machine: &'a mut CoreMachine,
}

pub type CoreMachine = DefaultCoreMachine<u64, BridgeMemory>;

impl<'a> GuestCpu<'a> {
    pub fn pc(&self) -> u64 {
        *self.machine.pc()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.machine.update_pc(pc);
        self.machine.commit_pc();
    }

    pub fn reg(&self, index: usize) -> u64 {
        self.machine.registers()[index]
    }

    pub fn set_reg(&mut self, index: usize, value: u64) {
        self.machine.set_register(index, value);
    }

    pub fn registers(&self) -> [u64; 32] {
        let mut out = [0u64; 32];
        out.copy_from_slice(&self.machine.registers()[0..32]);
        out
    }

    pub fn restore_registers(&mut self, saved: &[u64; 32]) {
        for (i, v) in saved.iter().enumerate() {
            self.machine.set_register(i, *v);
        }
    }

    pub fn memory_mut(&mut self) -> &mut BridgeMemory {
        self.machine.memory_mut()
    }
}

/// Why `GuestMachine::run` stopped. `CustomOpcode` hands control back to
/// the caller (which owns the dyncall array / dyn_args / registry) rather
/// than taking a callback, so the handler can borrow the full
/// `ScriptInstance` without aliasing the machine it's driving.
#[derive(Debug, Clone, Copy)]
pub enum StepEvent {
    Halted(i64),
    BudgetExhausted,
    CustomOpcode(CustomInstruction),
    /// `ecall` executed with no registered `ckb-vm` syscall handler (we
    /// never register one — every numbered syscall in §4.7, including the
    /// ones `FunctionGroup` stubs emit, is dispatched by `ScriptInstance`
    /// off the `a7` value after `run` returns this event).
    Ecall { a7: u64 },
}

/// A single forked VM: `ckb-vm`'s `DefaultMachine` plus our page-table-backed
/// memory and the custom-opcode interception described in the module docs.
pub struct GuestMachine {
    inner: DefaultMachine<CoreMachine>,
}

impl GuestMachine {
    pub fn new(memory_max: u64, max_cycles: u64) -> Self {
        let core = DefaultCoreMachine::new(ISA_IMC, ckb_vm::machine::VERSION1, max_cycles);
        let inner = DefaultMachineBuilder::new(core).build();
        let mut machine = Self { inner };
        machine.replace_memory(BridgeMemory::new(memory_max));
        machine
    }

    fn replace_memory(&mut self, memory: BridgeMemory) {
        *self.inner.memory_mut() = memory;
    }

    pub fn pc(&self) -> u64 {
        *self.inner.pc()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.inner.update_pc(pc);
        self.inner.commit_pc();
    }

    pub fn cpu(&mut self) -> GuestCpu<'_> {
        GuestCpu { machine: &mut self.inner }
    }

    pub fn memory(&self) -> &BridgeMemory {
        self.inner.memory()
    }

    pub fn memory_mut(&mut self) -> &mut BridgeMemory {
        self.inner.memory_mut()
    }

    pub fn load_elf(&mut self, bytes: &[u8], args: &[Bytes]) -> ScriptResult<u64> {
        let program = Bytes::copy_from_slice(bytes);
        self.inner
            .load_program(&program, args)
            .map_err(ScriptError::from)
    }

    pub fn registers(&self) -> [u64; 32] {
        let mut out = [0u64; 32];
        out.copy_from_slice(&self.inner.registers()[0..32]);
        out
    }

    pub fn restore_registers(&mut self, saved: &[u64; 32]) {
        for (i, v) in saved.iter().enumerate() {
            self.inner.set_register(i, *v);
        }
    }

    pub fn set_max_cycles(&mut self, max: u64) {
        self.inner.set_max_cycles(max);
    }

    pub fn max_cycles(&self) -> u64 {
        self.inner.max_cycles()
    }

    pub fn cycles(&self) -> u64 {
        self.inner.cycles()
    }

    /// `ckb-vm`'s instruction counter is cumulative across the whole life
    /// of the machine, not per-run; every fresh call/preempt must reset it
    /// so `set_max_cycles` (an absolute ceiling) actually grants a full
    /// budget instead of one that shrinks call over call.
    pub fn reset_cycles(&mut self) {
        self.inner.set_cycles(0);
    }

    /// Runs from the current PC until the guest exits, the cycle budget
    /// runs out, or a custom opcode surfaces. Custom opcodes are
    /// intercepted ahead of `ckb-vm`'s own decode/execute step: when the
    /// decoder bounces off one of the two opcodes this crate owns, we
    /// decode it and hand it back as [`StepEvent::CustomOpcode`] at the
    /// faulting PC, still uncommitted, rather than advancing past it or
    /// letting it surface as a guest fault. The caller is expected to act
    /// on the event, advance the PC itself (`set_pc(pc + 4)`), and call
    /// `run` again to continue.
    pub fn run(&mut self) -> ScriptResult<StepEvent> {
        match ckb_vm::run::<u64, BridgeMemory>(&mut self.inner) {
            Ok(code) => Ok(StepEvent::Halted(code as i64)),
            Err(CkbError::CyclesExceeded) => Ok(StepEvent::BudgetExhausted),
            Err(CkbError::InvalidEcall(_)) => {
                Ok(StepEvent::Ecall { a7: self.inner.registers()[A7_REG].to_u64() })
            }
            Err(CkbError::InvalidOp(_)) => {
                let pc = self.pc();
                let word = self.inner.memory_mut().execute_load32(pc)?;
                let decoded = decode_custom(word);
                match decoded.opcode {
                    OPCODE_DYNCALL_INDEXED | OPCODE_DYNARG_PUSH => {
                        Ok(StepEvent::CustomOpcode(decoded))
                    }
                    _ => Err(ScriptError::Machine(CkbError::InvalidOp(decoded.opcode as u16))),
                }
            }
            Err(other) => Err(ScriptError::from(other)),
        }
    }
}

/// Indices of the eight integer and four float argument registers, in ABI
/// order (a0..a7, fa0..fa3), used throughout far-call/remote-call register
/// shuffling.
pub const ARG_REGS: [usize; 8] = [A0, A0 + 1, A0 + 2, A0 + 3, A0 + 4, A0 + 5, A0 + 6, A0 + 7];

/// ckb-vm's ISA is integer-only (`ISA_IMC`, no hardware FPU): there is no
/// `fa0..fa3`. Float arguments in this ABI travel as raw bit patterns in
/// four otherwise-unused saved registers (`s2..s5`), by convention of the
/// guest toolchain that targets this host.
pub const FLOAT_ARG_REGS: [usize; 4] = [18, 19, 20, 21];

pub const RA_REG: usize = RA;
pub const T0_REG: usize = T0;
pub const T1_REG: usize = T1;
pub const A7_REG: usize = A7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_custom_opcode_fields() {
        // li a7, 42 style encoding is irrelevant here; we only decode our
        // own synthetic I-type layout.
        let word = (42i32 << 20) as u32 | (0b001 << 12) | OPCODE_DYNARG_PUSH;
        let decoded = decode_custom(word);
        assert_eq!(decoded.opcode, OPCODE_DYNARG_PUSH);
        assert_eq!(decoded.funct3, 0b001);
        assert_eq!(decoded.imm, 42);
    }

    #[test]
    fn bridge_memory_local_roundtrip() {
        let mut mem = BridgeMemory::new(MAX_MEMORY);
        mem.write_bytes(0x1000, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        mem.read_bytes(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn bridge_redirects_remote_range() {
        let mut remote_table = PageTable::new(MAX_MEMORY);
        remote_table.write(REMOTE_IMG_BASE + 0x10, b"zz").unwrap();

        let mut mem = BridgeMemory::new(MAX_MEMORY);
        unsafe {
            mem.install_bridge(&mut remote_table as *mut PageTable);
        }
        let mut buf = [0u8; 2];
        mem.read_bytes(REMOTE_IMG_BASE + 0x10, &mut buf).unwrap();
        assert_eq!(&buf, b"zz");

        mem.clear_bridge(None);
        // With the bridge cleared, the same address now resolves locally
        // (and is unmapped, so it allocates a fresh zeroed page).
        let mut buf2 = [0u8; 2];
        mem.read_bytes(REMOTE_IMG_BASE + 0x10, &mut buf2).unwrap();
        assert_eq!(&buf2, &[0, 0]);
    }
}
