//! The small, fixed-numbered syscall surface (§4.7). Numbers are part of
//! the ABI: the guest hard-codes them in assembly for performance-critical
//! paths, so they must never be renumbered.

use crate::error::{ScriptError, ScriptResult};
use crate::machine::{ARG_REGS, FLOAT_ARG_REGS, RA_REG, T0_REG, T1_REG};
use crate::script_instance::{CallTarget, ScriptInstance};

pub const SELF_TEST: u64 = 500;
pub const ASSERT_FAIL: u64 = 501;
pub const WRITE: u64 = 502;
pub const MEASURE: u64 = 503;
pub const DYNCALL: u64 = 504;
pub const FARCALL: u64 = 505;
pub const FARCALL_DIRECT: u64 = 506;
pub const INTERRUPT: u64 = 507;
pub const MACHINE_HASH: u64 = 508;
pub const EACH_FRAME: u64 = 509;
pub const MULTIPROCESS_FORK: u64 = 510;
pub const MULTIPROCESS_JOIN: u64 = 511;
pub const MULTIPROCESS_WAIT: u64 = 512;
pub const DYNCALL_WITH_ARGS: u64 = 513;
pub const GAME_SETTING: u64 = 514;
pub const GAME_EXIT: u64 = 515;
pub const SINF: u64 = 520;
pub const RANDF: u64 = 521;
pub const SMOOTHSTEP: u64 = 522;
pub const VEC_LENGTH: u64 = 523;
pub const VEC_ROTATE: u64 = 524;
pub const VEC_NORMALIZE: u64 = 525;

/// Synthetic syscall number written into [`crate::script_instance::RETURN_TRAMPOLINE`]'s
/// `li a7, RETURN_TRAP` stub. Must fit `encode_stub`'s 12-bit immediate
/// field and stay outside the 500..525 real-syscall range.
pub const RETURN_TRAP: u64 = 0xfff;

/// What the caller (`ScriptInstance::drive`) should do once `dispatch`
/// returns. Most syscalls are ordinary `ecall`s that resume at `pc + 4`;
/// the far-call family and function-group stubs use the "short-circuit
/// return" convention of jumping to `ra - 4` instead (§4.4, §4.7).
pub enum DispatchOutcome {
    Continue,
    ShortCircuitReturn,
}

fn read_f32(instance: &mut ScriptInstance, slot: usize) -> f32 {
    f32::from_bits(instance.machine_mut().cpu().reg(FLOAT_ARG_REGS[slot]) as u32)
}

fn write_f32(instance: &mut ScriptInstance, slot: usize, value: f32) {
    instance.machine_mut().cpu().set_reg(FLOAT_ARG_REGS[slot], value.to_bits() as u64);
}

fn read_c_string(instance: &mut ScriptInstance, addr: u64, max_len: usize) -> String {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        if bytes.len() >= max_len {
            break;
        }
        let mut byte = [0u8; 1];
        if !instance.machine_mut().memory_mut().local().read(cursor, &mut byte) || byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        cursor += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Dispatches on `a7` (read by the caller from the `ecall` that bounced
/// off `ckb-vm`'s decoder for lack of a registered syscall handler).
pub fn dispatch(instance: &mut ScriptInstance, a7: u64) -> ScriptResult<DispatchOutcome> {
    match a7 {
        SELF_TEST => self_test(instance),
        ASSERT_FAIL => assert_fail(instance),
        WRITE => write_syscall(instance),
        MEASURE => measure(instance),
        DYNCALL => dyncall_hashed(instance, false),
        DYNCALL_WITH_ARGS => dyncall_hashed(instance, true),
        FARCALL => farcall(instance, false, false),
        FARCALL_DIRECT => farcall(instance, true, true),
        INTERRUPT => farcall(instance, false, true),
        MACHINE_HASH => machine_hash(instance),
        EACH_FRAME => each_frame(instance),
        MULTIPROCESS_FORK | MULTIPROCESS_JOIN | MULTIPROCESS_WAIT => multiprocess_noop(instance),
        GAME_SETTING => game_setting(instance),
        GAME_EXIT => game_exit(instance),
        SINF => sinf(instance),
        RANDF => randf(instance),
        SMOOTHSTEP => smoothstep(instance),
        VEC_LENGTH => vec_length(instance),
        VEC_ROTATE => vec_rotate(instance),
        VEC_NORMALIZE => vec_normalize(instance),
        other => {
            if let Some((group_idx, slot)) = instance.function_group_for_pc(instance.machine().pc()) {
                return function_group_call(instance, group_idx, slot);
            }
            Err(ScriptError::LookupFailure(format!("unknown syscall number {other}")))
        }
    }
}

fn self_test(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let cpu = instance.machine_mut().cpu();
    let expect_i32 = cpu.reg(ARG_REGS[0]) as i32;
    let expect_u64_a = cpu.reg(ARG_REGS[1]);
    let expect_u64_b = cpu.reg(ARG_REGS[2]);
    log::debug!("self-test: {expect_i32} {expect_u64_a} {expect_u64_b}");
    Ok(DispatchOutcome::Continue)
}

fn assert_fail(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (expr_addr, file_addr, line, _func_addr) = {
        let cpu = instance.machine_mut().cpu();
        (cpu.reg(ARG_REGS[0]), cpu.reg(ARG_REGS[1]), cpu.reg(ARG_REGS[2]), cpu.reg(ARG_REGS[3]))
    };
    let expr = read_c_string(instance, expr_addr, 256);
    let file = read_c_string(instance, file_addr, 256);
    log::error!("guest assertion failed: {expr} at {file}:{line}");
    Err(ScriptError::GuestException {
        symbol: "<assert>".into(),
        address: instance.machine().pc(),
        detail: format!("{expr} at {file}:{line}"),
    })
}

fn write_syscall(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    const MAX_WRITE: usize = 1024;
    let (addr, len) = {
        let cpu = instance.machine_mut().cpu();
        (cpu.reg(ARG_REGS[0]), cpu.reg(ARG_REGS[1]) as usize)
    };
    let len = len.min(MAX_WRITE);
    let mut buf = vec![0u8; len];
    instance.machine_mut().memory_mut().local().read(addr, &mut buf);
    instance.print(&String::from_utf8_lossy(&buf));
    Ok(DispatchOutcome::Continue)
}

fn measure(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (name_addr, func_addr) = {
        let cpu = instance.machine_mut().cpu();
        (cpu.reg(ARG_REGS[0]), cpu.reg(ARG_REGS[1]))
    };
    let name = read_c_string(instance, name_addr, 128);
    let report = crate::benchmark::vmbench(instance, func_addr, 5)?;
    log::info!(
        "vmbench '{name}': low={}ns median={}ns high={}ns",
        report.lowest_ns, report.median_ns, report.highest_ns
    );
    Ok(DispatchOutcome::Continue)
}

fn dyncall_hashed(instance: &mut ScriptInstance, with_args: bool) -> ScriptResult<DispatchOutcome> {
    let (hash, name_addr) = {
        let cpu = instance.machine_mut().cpu();
        (cpu.reg(T0_REG) as u32, cpu.reg(T1_REG))
    };

    let entry = instance.host().dyncalls().get(hash);
    let result = match entry {
        Some(entry) => {
            instance.host().metrics().record_dyncall();
            (entry.handler)(instance)?
        }
        None => {
            let name = read_c_string(instance, name_addr, 128);
            return Err(ScriptError::unknown_dynamic_call(name, hash));
        }
    };
    instance.machine_mut().cpu().set_reg(ARG_REGS[0], result as u64);
    if with_args {
        instance.clear_dyn_args();
    }
    Ok(DispatchOutcome::Continue)
}

/// Shared implementation of `farcall` (505), `farcall-direct` (506), and
/// `interrupt` (507). `direct` means the second register is a raw address
/// rather than a public-API hash; `preempting` selects `preempt` over a
/// plain `call` on the target.
fn farcall(instance: &mut ScriptInstance, direct: bool, preempting: bool) -> ScriptResult<DispatchOutcome> {
    let (target_hash, func_selector, forwarded) = {
        let cpu = instance.machine_mut().cpu();
        let target_hash = cpu.reg(ARG_REGS[0]) as u32;
        let func_selector = cpu.reg(ARG_REGS[1]);
        let forwarded: Vec<i64> = ARG_REGS[2..].iter().map(|r| cpu.reg(*r) as i64).collect();
        (target_hash, func_selector, forwarded)
    };

    let target_ptr = instance
        .host()
        .lookup_instance(target_hash)
        .ok_or_else(|| ScriptError::ScriptNotFound(format!("<hash 0x{target_hash:08x}>")))?;

    // SAFETY: single-threaded cooperative scheduler; `target_ptr` is a
    // distinct, still-registered instance (never the caller itself, per
    // the ABI contract that far-calls always cross instances).
    let target = unsafe { &mut *target_ptr };

    let address = if direct {
        func_selector
    } else {
        target
            .api_function_from_hash(func_selector as u32)
            .filter(|addr| *addr != 0)
            .ok_or_else(|| ScriptError::lookup_failure(format!("<hash 0x{func_selector:08x}>")))?
    };

    instance.host().metrics().record_remote_call();
    let result = if preempting {
        target.preempt(CallTarget::Address(address), &forwarded)?
    } else {
        target.call(CallTarget::Address(address), &forwarded)?
    };
    // `call`/`preempt` reset the target's cycle counter before running, so
    // `cycles()` here is already just this call's consumption.
    let consumed = target.machine().cycles();
    // Budget monotonicity (§8 property 4): the caller is charged at least
    // what the callee consumed, preventing budget laundering through a
    // far-call. Both `cycles()` and `max_cycles()` are per-call here (the
    // caller's counter was reset at the start of its own `run_call`), so
    // the discount applies against the real remaining ceiling rather than
    // cycles already spent.
    let caller_max = instance.machine().max_cycles();
    let caller_used = instance.machine().cycles();
    instance
        .machine_mut()
        .set_max_cycles(caller_max.saturating_sub(consumed).max(caller_used));

    instance.machine_mut().cpu().set_reg(ARG_REGS[0], result as u64);
    Ok(DispatchOutcome::ShortCircuitReturn)
}

fn machine_hash(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let hash = instance.hash();
    instance.machine_mut().cpu().set_reg(ARG_REGS[0], hash as u64);
    Ok(DispatchOutcome::Continue)
}

fn each_frame(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (addr, reason) = {
        let cpu = instance.machine_mut().cpu();
        (cpu.reg(ARG_REGS[0]), cpu.reg(ARG_REGS[1]) as u32)
    };
    instance.set_tick_event(addr, reason);
    Ok(DispatchOutcome::Continue)
}

/// Guest-internal parallelism within one VM's own fork; orthogonal to the
/// remote-call bridge and out of scope for this crate beyond acking the
/// syscall so guest code doesn't treat it as `UnknownDynamicCall`.
fn multiprocess_noop(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    instance.machine_mut().cpu().set_reg(ARG_REGS[0], 0);
    Ok(DispatchOutcome::Continue)
}

fn game_setting(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let key_addr = instance.machine_mut().cpu().reg(ARG_REGS[0]);
    let key = read_c_string(instance, key_addr, 128);
    let (present, value) = instance.host().get_setting(&key);
    instance.machine_mut().cpu().set_reg(ARG_REGS[0], present as u64);
    instance.machine_mut().cpu().set_reg(ARG_REGS[1], value);
    Ok(DispatchOutcome::Continue)
}

fn game_exit(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let stopped = instance.host().invoke_exit_callbacks();
    instance.machine_mut().cpu().set_reg(ARG_REGS[0], stopped as u64);
    Ok(DispatchOutcome::Continue)
}

fn function_group_call(
    instance: &mut ScriptInstance,
    group_idx: usize,
    slot: u32,
) -> ScriptResult<DispatchOutcome> {
    let handler = instance
        .function_groups()
        .get(group_idx)
        .and_then(|g| g.handler_for_slot(slot))
        .cloned()
        .ok_or_else(|| ScriptError::LookupFailure(format!("function group {group_idx} slot {slot} unbound")))?;
    let mut cpu = instance.machine_mut().cpu();
    handler(&mut cpu)?;
    Ok(DispatchOutcome::ShortCircuitReturn)
}

fn sinf(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let x = read_f32(instance, 0);
    write_f32(instance, 0, x.sin());
    Ok(DispatchOutcome::Continue)
}

fn randf(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    use rand::Rng;
    let value: f32 = rand::thread_rng().gen_range(0.0..1.0);
    write_f32(instance, 0, value);
    Ok(DispatchOutcome::Continue)
}

fn smoothstep(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let edge0 = read_f32(instance, 0);
    let edge1 = read_f32(instance, 1);
    let x = read_f32(instance, 2);
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    write_f32(instance, 0, t * t * (3.0 - 2.0 * t));
    Ok(DispatchOutcome::Continue)
}

fn vec_length(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (x, y, z) = (read_f32(instance, 0), read_f32(instance, 1), read_f32(instance, 2));
    write_f32(instance, 0, (x * x + y * y + z * z).sqrt());
    Ok(DispatchOutcome::Continue)
}

fn vec_normalize(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (x, y, z) = (read_f32(instance, 0), read_f32(instance, 1), read_f32(instance, 2));
    let len = (x * x + y * y + z * z).sqrt();
    let (nx, ny, nz) = if len > f32::EPSILON { (x / len, y / len, z / len) } else { (0.0, 0.0, 0.0) };
    write_f32(instance, 0, nx);
    write_f32(instance, 1, ny);
    write_f32(instance, 2, nz);
    Ok(DispatchOutcome::Continue)
}

fn vec_rotate(instance: &mut ScriptInstance) -> ScriptResult<DispatchOutcome> {
    let (x, y) = (read_f32(instance, 0), read_f32(instance, 1));
    let angle = read_f32(instance, 2);
    let (sin, cos) = angle.sin_cos();
    write_f32(instance, 0, x * cos - y * sin);
    write_f32(instance, 1, x * sin + y * cos);
    Ok(DispatchOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_match_the_abi() {
        assert_eq!(WRITE, 502);
        assert_eq!(FARCALL, 505);
        assert_eq!(DIRECT_FARCALL_MATCHES, FARCALL_DIRECT);
        assert_eq!(INTERRUPT, 507);
        assert_eq!(DYNCALL_WITH_ARGS, 513);
    }

    const DIRECT_FARCALL_MATCHES: u64 = 506;
}
