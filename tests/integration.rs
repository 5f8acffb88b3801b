//! Integration tests exercising a real (if tiny) ELF boot lifecycle:
//! `ScriptInstance::new` loads one of `common`'s hand-assembled images,
//! runs it to the trampoline, and the rest of the scenario drives calls
//! against the booted instance.

mod common;

use std::sync::Arc;

use script_host::binary_store::Binary;
use script_host::host::Host;
use script_host::script_instance::{CallTarget, ScriptInstance};

fn binary_with(name: &str, bytes: &[u8]) -> Arc<Binary> {
    let mut store = script_host::binary_store::BinaryStore::new();
    store.insert(name, bytes.to_vec(), Vec::new()).unwrap();
    store.get(name).unwrap()
}

#[test]
fn basic_call_returns_the_booted_value() {
    let binary = binary_with("returns_666", common::RETURNS_666_ELF);
    let instance = ScriptInstance::new(binary, "returns_666", Host::new(), false).unwrap();
    assert_eq!(instance.boot_return(), 666);
}

#[test]
fn call_by_address_returns_a_32_bit_constant() {
    let binary = binary_with("returns_deadbeef", common::RETURNS_DEADBEEF_ELF);
    let mut instance = ScriptInstance::new(binary, "returns_deadbeef", Host::new(), false).unwrap();
    let result = instance
        .call(CallTarget::Address(common::RETURNS_DEADBEEF_ENTRY), &[])
        .unwrap();
    assert_eq!(result as u32, 0xDEAD_BEEFu32);
}

#[test]
fn preempt_can_be_called_repeatedly_without_drift() {
    let binary = binary_with("returns_666_preempt", common::RETURNS_666_ELF);
    let mut instance = ScriptInstance::new(binary, "returns_666_preempt", Host::new(), false).unwrap();
    for _ in 0..3 {
        let result = instance
            .preempt(CallTarget::Address(common::RETURNS_666_ENTRY), &[])
            .unwrap();
        assert_eq!(result, 666);
    }
}

#[test]
fn address_of_missing_symbol_is_lookup_failure() {
    let binary = binary_with("returns_666_lookup", common::RETURNS_666_ELF);
    let instance = ScriptInstance::new(binary, "returns_666_lookup", Host::new(), false).unwrap();
    assert!(instance.address_of("no_such_symbol").is_none());
}

#[test]
fn timeout_recovers_and_a_later_call_still_succeeds() {
    let binary = binary_with("boot_then_loop", common::BOOT_THEN_LOOP_ELF);
    let mut instance = ScriptInstance::new(binary, "boot_then_loop", Host::new(), false).unwrap();
    assert_eq!(instance.boot_return(), 0);

    let result = instance.call(CallTarget::Address(common::BOOT_THEN_LOOP_FN), &[]).unwrap();
    assert_eq!(result, -1);
    assert_eq!(instance.budget_overruns(), 1);

    let result = instance.call(CallTarget::Address(common::BOOT_THEN_LOOP_ENTRY), &[]).unwrap();
    assert_eq!(result, 0);
    assert_eq!(instance.budget_overruns(), 1);
}

#[test]
fn two_instances_share_a_host_but_not_vm_state() {
    let host = Host::new();
    let a = ScriptInstance::new(
        binary_with("a", common::RETURNS_666_ELF),
        "a",
        host.clone(),
        false,
    )
    .unwrap();
    let b = ScriptInstance::new(
        binary_with("b", common::RETURNS_DEADBEEF_ELF),
        "b",
        host,
        false,
    )
    .unwrap();
    assert_eq!(a.boot_return(), 666);
    assert_eq!(b.boot_return() as u32, 0xDEAD_BEEFu32);
    assert_ne!(a.hash(), b.hash());
}
