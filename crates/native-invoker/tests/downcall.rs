//! Cooperative downcall stubs executed on the interpreter.
//!
//! Host functions stand in for the native target and the runtime services and
//! observe the thread record while they run.

use std::cell::RefCell;
use std::rc::Rc;

use native_invoker::a64::registers::{V0, X0, X1, X2, X3, X4, X5, X6, X7};
use native_invoker::a64::{Cond, Gpr, Instruction};
use native_invoker::abi::{SHUFFLE_SCRATCH, THREAD_REG, TMP1};
use native_invoker::callconv::{ManagedCallConv, NativeCallConv};
use native_invoker::invoker::ReservedRegisters;
use native_invoker::shuffle::ArgumentShuffle;
use native_invoker::test_harness::*;
use native_invoker::thread::{ExecutionState, POLL_ARMED, POLL_DISARMED, StackGuardState};
use native_invoker::{
    DowncallSignature, Error, HeapCodeAllocator, Location, SafetyProfile, StandardRuntime,
    ValueType, make_native_invoker,
};

const TARGET: u64 = 0x5000;
const NATIVE: u32 = 4;
const TRANSITION: u32 = 5;
const MANAGED: u32 = 8;

fn gpr(reg: Gpr) -> Location {
    Location::Gpr(reg)
}

fn signature(
    args: &[ValueType],
    ret: ValueType,
    inputs: &[Location],
    outputs: &[Location],
) -> DowncallSignature {
    DowncallSignature::new(args.to_vec(), ret, inputs.to_vec(), outputs.to_vec())
}

#[test]
fn short_result_is_truncated_and_sign_extended() {
    let sig = signature(
        &[ValueType::Long, ValueType::Short],
        ValueType::Short,
        &[gpr(X0)],
        &[gpr(X0)],
    );
    let stub = downcall_stub(&sig).unwrap();
    assert_eq!(stub.profile(), SafetyProfile::Cooperative);

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    m.register_host_fn(TARGET, |m| m.x[0] = m.x[0].wrapping_mul(2));
    m.x[1] = TARGET;
    m.x[2] = 20_000;
    m.run(stub.code(), stub.address()).unwrap();

    assert_eq!(m.x[0] as i64, -25_536);
    assert_eq!(thread.state(&m), MANAGED);
    assert_eq!(thread.anchor(&m), (0, 0, 0));
    assert_eq!(m.sp, STACK_TOP);
    assert_eq!(m.host_calls(), vec![TARGET]);
}

#[test]
fn int_result_overflowing_32_bits_is_sign_extended() {
    let sig = signature(
        &[ValueType::Long, ValueType::Int],
        ValueType::Int,
        &[gpr(X0)],
        &[gpr(X0)],
    );
    let stub = downcall_stub(&sig).unwrap();

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    let seen = Rc::new(RefCell::new(0));
    let log = Rc::clone(&seen);
    m.register_host_fn(TARGET, move |m| {
        *log.borrow_mut() = m.x[0];
        m.x[0] = m.x[0].wrapping_mul(2);
    });
    m.x[1] = TARGET;
    // Stale upper half: the argument move keeps only the low word.
    m.x[2] = 0xFFFF_FFFF_6000_0000;
    m.run(stub.code(), stub.address()).unwrap();

    assert_eq!(*seen.borrow(), 0x6000_0000);
    assert_eq!(m.x[0] as i64, -0x4000_0000);
    assert_eq!(thread.state(&m), MANAGED);
    assert_eq!(m.host_calls(), vec![TARGET]);
}

#[test]
fn swapped_arguments_go_through_the_scratch() {
    let args = [ValueType::Long, ValueType::Long, ValueType::Long];
    let inputs = [gpr(X3), gpr(X2)];
    let sig = signature(&args, ValueType::Long, &inputs, &[gpr(X0)]);

    let managed = ManagedCallConv::new(&args).unwrap();
    let native = NativeCallConv::new(TMP1, &inputs);
    let plan = ArgumentShuffle::new(&args, &managed, &native, SHUFFLE_SCRATCH, 16).unwrap();
    assert_eq!(plan.cycle_breaks(), 1);

    let stub = downcall_stub(&sig).unwrap();
    let mut m = Machine::new();
    ThreadImage::install(&mut m);
    let seen = Rc::new(RefCell::new((0, 0)));
    let log = Rc::clone(&seen);
    m.register_host_fn(TARGET, move |m| {
        *log.borrow_mut() = (m.x[3], m.x[2]);
        m.x[0] = m.x[3] - m.x[2];
    });
    m.x[1] = TARGET;
    m.x[2] = 100;
    m.x[3] = 58;
    m.run(stub.code(), stub.address()).unwrap();

    assert_eq!(*seen.borrow(), (100, 58));
    assert_eq!(m.x[0], 42);
}

#[test]
fn stack_arguments_reach_the_native_frame() {
    let mut args = vec![ValueType::Long];
    args.extend([ValueType::Long; 9]);
    let mut inputs: Vec<Location> = [X0, X1, X2, X3, X4, X5, X6, X7]
        .into_iter()
        .map(Location::Gpr)
        .collect();
    inputs.push(Location::Stack(0));
    let sig = signature(&args, ValueType::Long, &inputs, &[gpr(X0)]);
    let stub = downcall_stub(&sig).unwrap();
    // 16 header, 16 outgoing, 8 spill rounded up.
    assert_eq!(stub.frame_size_bytes(), 48);

    let mut m = Machine::new();
    ThreadImage::install(&mut m);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    m.register_host_fn(TARGET, move |m| {
        let mut values: Vec<u64> = m.x[..8].to_vec();
        values.push(m.read_u64(m.sp));
        *log.borrow_mut() = values;
        m.x[0] = 7;
    });
    // Managed: target in x1, then x2..x7, x0, then the caller's stack.
    m.x[1] = TARGET;
    for (i, reg) in [2usize, 3, 4, 5, 6, 7, 0].into_iter().enumerate() {
        m.x[reg] = 100 + i as u64;
    }
    m.write_u64(STACK_TOP, 107);
    m.write_u64(STACK_TOP + 8, 108);
    m.run(stub.code(), stub.address()).unwrap();

    assert_eq!(*seen.borrow(), (100..109).collect::<Vec<u64>>());
    assert_eq!(m.x[0], 7);
}

#[test]
fn bare_frame_publishes_anchor_while_native() {
    let sig = signature(&[ValueType::Long], ValueType::Void, &[], &[]);
    let stub = downcall_stub(&sig).unwrap();
    assert_eq!(stub.frame_size_bytes(), 16);

    let maps = stub.root_maps().unwrap();
    assert_eq!(maps.len(), 1);
    let (pc_offset, map) = maps.iter().next().unwrap();
    assert!(map.roots.is_empty());
    assert_eq!(map.frame_size_words, 2);
    assert_eq!(pc_offset, stub.frame_complete());

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    let seen = Rc::new(RefCell::new(None));
    let log = Rc::clone(&seen);
    m.register_host_fn(TARGET, move |m| {
        *log.borrow_mut() = Some((thread.state(m), thread.anchor(m), m.sp));
    });
    m.x[1] = TARGET;
    m.run(stub.code(), stub.address()).unwrap();

    let (state, (sp, fp, pc), sp_at_call) = seen.borrow().unwrap();
    assert_eq!(state, NATIVE);
    assert_eq!(sp, sp_at_call);
    assert_eq!(fp, STACK_TOP - 16);
    assert_eq!(pc, stub.address() + u64::from(pc_offset));
    assert_eq!(thread.state(&m), MANAGED);
    assert_eq!(thread.anchor(&m), (0, 0, 0));
}

#[test]
fn generation_is_deterministic() {
    let sig = signature(
        &[ValueType::Long, ValueType::Int, ValueType::Double],
        ValueType::Float,
        &[gpr(X0), Location::Fpr(V0)],
        &[Location::Fpr(V0)],
    );
    let a = downcall_stub(&sig).unwrap();
    let b = downcall_stub(&sig).unwrap();
    assert_eq!(a.bytes(), b.bytes());
    assert_eq!(a.frame_complete(), b.frame_complete());
}

#[test]
fn pending_suspend_request_takes_the_slow_path() {
    let sig = signature(
        &[ValueType::Long, ValueType::Long],
        ValueType::Long,
        &[gpr(X0)],
        &[gpr(X0)],
    );
    let stub = downcall_stub(&sig).unwrap();

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    let sp_at_call = Rc::new(RefCell::new(0));
    let call_log = Rc::clone(&sp_at_call);
    m.register_host_fn(TARGET, move |m| {
        *call_log.borrow_mut() = m.sp;
        thread.set_suspend_flags(m, 1);
        m.x[0] += 1;
    });
    let seen = Rc::new(RefCell::new(None));
    let log = Rc::clone(&seen);
    m.register_host_fn(StandardRuntime::DEFAULT_CHECK_SPECIAL_CONDITION, move |m| {
        *log.borrow_mut() = Some((m.x[0], thread.state(m), thread.anchor(m)));
        thread.set_suspend_flags(m, 0);
        m.x[0] = 0xBAD;
    });
    m.x[1] = TARGET;
    m.x[2] = 41;
    m.run(stub.code(), stub.address()).unwrap();

    let (thread_arg, state, (sp, fp, pc)) = seen.borrow().unwrap();
    assert_eq!((thread_arg, state), (THREAD_BASE, TRANSITION));
    // The last managed frame is still walkable while the runtime runs.
    assert_ne!(sp, 0);
    assert_eq!(sp, *sp_at_call.borrow());
    assert_eq!(fp, STACK_TOP - 16);
    assert_eq!(pc, stub.address() + u64::from(stub.frame_complete()));
    assert_eq!(m.x[0], 42);
    assert_eq!(thread.anchor(&m), (0, 0, 0));
    assert_eq!(
        m.host_calls(),
        vec![TARGET, StandardRuntime::DEFAULT_CHECK_SPECIAL_CONDITION]
    );
    assert_eq!(thread.state(&m), MANAGED);
}

#[test]
fn armed_poll_takes_the_slow_path() {
    let sig = signature(
        &[ValueType::Long, ValueType::Double],
        ValueType::Double,
        &[Location::Fpr(V0)],
        &[Location::Fpr(V0)],
    );
    let stub = downcall_stub(&sig).unwrap();

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    let sp_at_call = Rc::new(RefCell::new(0));
    let call_log = Rc::clone(&sp_at_call);
    m.register_host_fn(TARGET, move |m| {
        *call_log.borrow_mut() = m.sp;
        thread.set_polling_word(m, POLL_ARMED);
        let x = f64::from_bits(m.v[0] as u64);
        m.v[0] = u128::from((x * 2.0).to_bits());
    });
    let seen = Rc::new(RefCell::new(None));
    let log = Rc::clone(&seen);
    m.register_host_fn(StandardRuntime::DEFAULT_CHECK_SPECIAL_CONDITION, move |m| {
        *log.borrow_mut() = Some((thread.state(m), thread.anchor(m)));
        thread.set_polling_word(m, POLL_DISARMED);
        m.v[0] = 0;
    });
    m.x[1] = TARGET;
    m.v[0] = u128::from(1.25f64.to_bits());
    m.run(stub.code(), stub.address()).unwrap();

    let (state, (sp, fp, pc)) = seen.borrow().unwrap();
    assert_eq!(state, TRANSITION);
    assert_ne!(sp, 0);
    assert_eq!(sp, *sp_at_call.borrow());
    assert_eq!(fp, STACK_TOP - 16);
    assert_eq!(pc, stub.address() + u64::from(stub.frame_complete()));
    assert_eq!(f64::from_bits(m.v[0] as u64), 2.5);
    assert_eq!(m.host_calls().len(), 2);
    assert_eq!(thread.anchor(&m), (0, 0, 0));
}

#[test]
fn disabled_yellow_zone_is_reguarded() {
    let sig = signature(
        &[ValueType::Long],
        ValueType::Int,
        &[],
        &[gpr(X0)],
    );
    let stub = downcall_stub(&sig).unwrap();

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    thread.set_guard_state(&mut m, StackGuardState::YellowReservedDisabled as u8);
    m.register_host_fn(TARGET, |m| m.x[0] = 0xFFFF_FFFF);
    m.register_host_fn(StandardRuntime::DEFAULT_REGUARD_STACK, move |m| {
        assert_eq!(thread.state(m), MANAGED);
        thread.set_guard_state(m, StackGuardState::Enabled as u8);
        m.x[0] = 0;
    });
    m.x[1] = TARGET;
    m.run(stub.code(), stub.address()).unwrap();

    assert_eq!(m.x[0] as i64, -1);
    assert_eq!(
        m.host_calls(),
        vec![TARGET, StandardRuntime::DEFAULT_REGUARD_STACK]
    );
    assert_eq!(thread.guard_state(&m), StackGuardState::Enabled as u8);
}

#[test]
fn bool_result_is_normalized() {
    let sig = signature(&[ValueType::Long], ValueType::Bool, &[], &[gpr(X0)]);
    let stub = downcall_stub(&sig).unwrap();
    for (raw, expected) in [(0x100u64, 0u64), (0x2, 1), (0, 0)] {
        let mut m = Machine::new();
        ThreadImage::install(&mut m);
        m.register_host_fn(TARGET, move |m| m.x[0] = raw);
        m.x[1] = TARGET;
        m.run(stub.code(), stub.address()).unwrap();
        assert_eq!(m.x[0], expected, "native value {raw:#x}");
    }
}

#[test]
fn state_stores_are_ordered_around_the_call() {
    let sig = signature(&[ValueType::Long], ValueType::Void, &[], &[]);
    let stub = downcall_stub(&sig).unwrap();

    let mut m = Machine::new();
    let thread = ThreadImage::install(&mut m);
    m.register_host_fn(TARGET, |_| {});
    m.x[1] = TARGET;
    m.run(stub.code(), stub.address()).unwrap();

    let state_addr = thread.address_of_state();
    let (sp_addr, fp_addr, pc_addr) = thread.anchor_addresses();
    let store_to = |addr: u64, value: u128, release: bool| {
        m.events.iter().position(|e| {
            *e == Event::Store {
                addr,
                size: if addr == state_addr { 4 } else { 8 },
                value,
                release,
            }
        })
    };

    let native = store_to(state_addr, u128::from(NATIVE), true).unwrap();
    let transition = store_to(state_addr, u128::from(TRANSITION), false).unwrap();
    let managed = store_to(state_addr, u128::from(MANAGED), true).unwrap();
    let call = m
        .events
        .iter()
        .position(|e| *e == Event::HostCall { addr: TARGET })
        .unwrap();

    let published = |target: u64| {
        m.events
            .iter()
            .position(|e| matches!(e, Event::Store { addr, value, .. } if *addr == target && *value != 0))
            .unwrap()
    };
    let anchor_pc = published(pc_addr);
    let anchor_fp = published(fp_addr);
    let anchor_sp = published(sp_addr);
    assert!(anchor_pc < anchor_fp && anchor_fp < anchor_sp && anchor_sp < native);
    assert!(native < call && call < transition && transition < managed);

    assert_eq!(m.events[transition + 1], Event::Barrier);
    assert!(matches!(m.events[transition + 2], Event::LoadAcquire { .. }));

    let cleared_sp = store_to(sp_addr, 0, false).unwrap();
    let cleared_fp = store_to(fp_addr, 0, false).unwrap();
    let cleared_pc = store_to(pc_addr, 0, false).unwrap();
    assert!(managed < cleared_sp && cleared_sp < cleared_fp && cleared_fp < cleared_pc);
}

#[test]
fn stub_shape_matches_the_transition_protocol() {
    let sig = signature(
        &[ValueType::Long, ValueType::Int],
        ValueType::Int,
        &[gpr(X0)],
        &[gpr(X0)],
    );
    let stub = downcall_stub(&sig).unwrap();
    let instrs = stub.code().instructions();

    assert_has_pattern(
        instrs,
        &[
            InstructionPattern::Blr {
                target: Pat::Exact(TMP1),
            },
            InstructionPattern::Sbfm {
                wide: Pat::Exact(true),
                dst: Pat::Exact(X0),
                imms: Pat::Exact(31),
            },
            InstructionPattern::Movz {
                dst: Pat::Any,
                imm: Pat::Exact(ExecutionState::NativeTransition.raw() as u16),
            },
            InstructionPattern::Str {
                width: Pat::Any,
                src: Pat::Any,
                base: Pat::Exact(THREAD_REG),
                offset: Pat::Exact(0),
            },
            InstructionPattern::DmbIsh,
        ],
    );
    assert_eq!(
        count_matching(
            instrs,
            &InstructionPattern::Stlr {
                wide: Pat::Exact(false),
                src: Pat::Any
            }
        ),
        2
    );
    assert_eq!(
        count_matching(
            instrs,
            &InstructionPattern::BCond {
                cond: Pat::Predicate(|c| matches!(c, Cond::Hi | Cond::Eq)),
            }
        ),
        2
    );
    assert!(instrs.contains(&Instruction::Ret {
        target: native_invoker::a64::registers::LR
    }));
}

#[test]
fn fatal_signatures_reserve_nothing() {
    let runtime = StandardRuntime::default();
    let mut alloc = HeapCodeAllocator::default();

    let two_outputs = signature(
        &[ValueType::Long],
        ValueType::Long,
        &[],
        &[gpr(X0), gpr(X1)],
    );
    assert!(matches!(
        make_native_invoker(&two_outputs, &runtime, &mut alloc),
        Err(Error::MultiRegisterReturn(2))
    ));

    let mut shadow = signature(&[ValueType::Long], ValueType::Void, &[], &[]);
    shadow.shadow_space = 16;
    assert!(matches!(
        make_native_invoker(&shadow, &runtime, &mut alloc),
        Err(Error::ShadowSpace(16))
    ));

    let thread_input = signature(
        &[ValueType::Long, ValueType::Long],
        ValueType::Void,
        &[gpr(THREAD_REG)],
        &[],
    );
    assert!(matches!(
        make_native_invoker(&thread_input, &runtime, &mut alloc),
        Err(Error::RegisterConflict {
            role: "thread register",
            ..
        })
    ));
    assert!(ReservedRegisters::for_signature(&thread_input).is_err());

    // The outgoing area still fits in u32, the frame around it does not.
    let far_slot = signature(
        &[ValueType::Long, ValueType::Long],
        ValueType::Long,
        &[Location::Stack(u32::MAX - 47)],
        &[gpr(X0)],
    );
    assert!(matches!(
        make_native_invoker(&far_slot, &runtime, &mut alloc),
        Err(Error::ImmediateOutOfRange {
            what: "downcall frame size",
            ..
        })
    ));

    assert!(alloc.regions().is_empty());

    let ok = signature(&[ValueType::Long, ValueType::Long], ValueType::Void, &[gpr(X2)], &[]);
    assert!(make_native_invoker(&ok, &runtime, &mut alloc).is_ok());
    assert_eq!(alloc.regions().len(), 1);
}
