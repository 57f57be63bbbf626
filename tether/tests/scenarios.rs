//! End-to-end scenarios against the scriptable mock target.
//!
//! The fixture models a small program: `main.main` calls `main.testnext`,
//! which contains a conditional at line 10 branching to lines 11 and 15,
//! and a goroutine handoff near the end of the function at line 20.

use std::path::Path;

use tether::testing::MockDebugData;
use tether::testing::MockTarget;
use tether::BreakpointKind;
use tether::Error;
use tether::Pid;
use tether::Session;
use tether::TraceEvent;
use tether::VariableDef;
use tether::VariableKind;
use tether::TRAP_INSTRUCTION;

const SRC: &str = "/go/src/testnext/testnext.go";

const T1: Pid = Pid::from_raw(100);
const T2: Pid = Pid::from_raw(101);

// Function layout.
const MAIN_ENTRY: u64 = 0x1000;
const TESTNEXT_LINE10: u64 = 0x1210;
const TESTNEXT_LINE11: u64 = 0x1220;
const TESTNEXT_LINE15: u64 = 0x1250;
const TESTNEXT_LINE20: u64 = 0x12e0;
const GETG_ENTRY: u64 = 0x2000;
const GETG_CALL_STOP: u64 = 0x200e; // getg end - 2
const GOEXIT_PC: u64 = 0x3005;

// Goroutine structs and stacks.
const G1: u64 = 0x7000;
const G2: u64 = 0x7100;
const SP1: u64 = 0x8000;
const SP2: u64 = 0x8800;

fn src() -> &'static Path {
    Path::new(SRC)
}

fn fixture_data() -> MockDebugData {
    let mut data = MockDebugData::default();

    data.add_function("main.main", MAIN_ENTRY, 0x1100);
    data.add_function("main.testnext", 0x1200, 0x1300);
    data.add_function("runtime.getg", GETG_ENTRY, 0x2010);
    data.add_function("runtime.goexit", 0x3000, 0x3010);
    data.add_function("runtime.breakpoint", 0x4000, 0x4010);
    data.add_function("runtime.futex", 0x5000, 0x5010);

    data.add_line(src(), 37, MAIN_ENTRY);
    data.add_line(src(), 10, TESTNEXT_LINE10);
    data.add_line(src(), 11, TESTNEXT_LINE11);
    data.add_line(src(), 15, TESTNEXT_LINE15);
    data.add_line(src(), 20, TESTNEXT_LINE20);

    // Line 10 is a conditional: control continues at line 11 or jumps to
    // line 15. Line 20 is the last statement of the function.
    data.add_next_lines(src(), 10, &[11, 15]);
    data.add_next_lines(src(), 20, &[]);

    data.add_fde(MAIN_ENTRY..0x1100, 0, 16);
    data.add_fde(0x1200..0x1300, 0, 16);
    data.add_fde(GETG_ENTRY..0x2010, 0, 8);

    data.symbols.insert("runtime.allglen".into(), 0x9000);
    data.symbols.insert("runtime.allg".into(), 0x9010);

    // Offsets inside runtime.g: goid, sched.pc, sched.sp, gopc, waitreason.
    data.layout.goid = 0;
    data.layout.sched_pc = 8;
    data.layout.sched_sp = 16;
    data.layout.go_pc = 24;
    data.layout.wait_reason = 32;

    data
}

/// Seeds a `runtime.g` struct with an empty wait reason.
fn seed_goroutine(target: &mut MockTarget, g: u64, id: i64, pc: u64, sp: u64) {
    target.mem_set_word(g, id as u64);
    target.mem_set_word(g + 8, pc);
    target.mem_set_word(g + 16, sp);
    target.mem_set_word(g + 24, MAIN_ENTRY);
    target.mem_set_word(g + 32, 0); // wait reason data
    target.mem_set_word(g + 40, 0); // wait reason length
}

/// A single-threaded target stopped in `main.testnext`, wired up so that
/// `runtime.getg` calls work: the word above the stack pointer holds the
/// current g.
fn testnext_target() -> MockTarget {
    let mut target = MockTarget::new(&[T1]);
    target.supports_hw = false;
    target.set_regs(T1, TESTNEXT_LINE10, SP1);

    // Instruction bytes that breakpoints will patch over.
    target.mem_set(MAIN_ENTRY, &[0x55]);
    target.mem_set(TESTNEXT_LINE11, &[0xaa]);
    target.mem_set(TESTNEXT_LINE15, &[0xbb]);
    target.mem_set(GETG_CALL_STOP, &[0x90]);

    seed_goroutine(&mut target, G1, 42, TESTNEXT_LINE10, SP1);
    target.mem_set_word(SP1 + 8, G1); // *g for runtime.getg

    target
}

/// Queues the trap produced by a `runtime.getg` forced call finishing: a
/// software breakpoint at `end - 2` reports the next instruction.
fn push_getg_stop(target: &mut MockTarget, tid: Pid) {
    target.push_stop(TraceEvent::Trap(tid), Some((tid, GETG_CALL_STOP + 1)));
}

#[test]
fn s1_hit_then_continue_hardware() {
    let mut target = MockTarget::new(&[T1]);
    target.set_regs(T1, 0x0f00, SP1);
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    let bp = session.set_breakpoint_at("main.main").unwrap();
    assert_eq!(bp.id, 1);
    assert_eq!(bp.kind, BreakpointKind::Hardware { slot: 0 });
    assert_eq!(bp.addr, MAIN_ENTRY);

    // Hardware stops report the armed address exactly.
    session
        .target_mut()
        .push_stop(TraceEvent::Trap(T1), Some((T1, MAIN_ENTRY)));

    session.cont().unwrap();

    assert_eq!(session.current_breakpoint().unwrap().id, 1);
    assert!(!session.running());
    assert_eq!(session.target().interrupted, vec![T1]);
}

#[test]
fn s2_step_over_software_breakpoint() {
    let mut target = testnext_target();
    target.set_regs(T1, 0x0f00, SP1);
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    let bp = session.set_breakpoint_at("main.main").unwrap();
    assert!(!bp.is_hardware());
    assert_eq!(session.target().mem_get(MAIN_ENTRY), Some(TRAP_INSTRUCTION));

    // Run into the breakpoint; the CPU stops just past the trap byte.
    session
        .target_mut()
        .push_stop(TraceEvent::Trap(T1), Some((T1, MAIN_ENTRY + 1)));
    session.cont().unwrap();
    assert_eq!(session.current_breakpoint().unwrap().id, 1);

    session.step().unwrap();

    // One instruction executed, and the breakpoint is back in place with
    // the trap byte re-patched.
    assert_eq!(session.current_pc().unwrap(), MAIN_ENTRY + 1);
    assert_eq!(session.target().stepped, vec![T1]);
    assert!(session.find_breakpoint(MAIN_ENTRY).is_some());
    assert_eq!(session.target().mem_get(MAIN_ENTRY), Some(TRAP_INSTRUCTION));
}

#[test]
fn s3_hardware_exhaustion_and_slot_reuse() {
    let mut target = MockTarget::new(&[T1]);
    target.set_regs(T1, 0x0f00, SP1);
    let addrs = [0x1210u64, 0x1220, 0x1250, 0x12e0, 0x1010];
    for addr in addrs {
        target.mem_set(addr, &[0x11]);
    }
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    let kinds: Vec<BreakpointKind> = addrs
        .iter()
        .map(|addr| session.set_breakpoint(*addr).unwrap().kind)
        .collect();

    for (slot, kind) in kinds.iter().take(4).enumerate() {
        assert_eq!(*kind, BreakpointKind::Hardware { slot });
    }
    assert!(matches!(kinds[4], BreakpointKind::Software { .. }));

    // Freeing slot 1 makes it the lowest free slot for the next install.
    session.clear_breakpoint(addrs[1]).unwrap();
    let reused = session.set_breakpoint(0x1280).unwrap();
    assert_eq!(reused.kind, BreakpointKind::Hardware { slot: 1 });
    assert_eq!(reused.id, 6);
}

#[test]
fn s4_next_over_conditional() {
    let mut session = Session::attach_with(testnext_target(), T1, &fixture_data()).unwrap();

    let target = session.target_mut();
    // The initial current-goroutine lookup.
    push_getg_stop(target, T1);
    // The branch lands on line 11's candidate breakpoint.
    target.push_stop(TraceEvent::Trap(T1), Some((T1, TESTNEXT_LINE11 + 1)));
    // The arrival check calls runtime.getg again.
    push_getg_stop(target, T1);

    session.next().unwrap();

    // Temp breakpoints were installed at both candidates but not at the
    // current line.
    let target = session.target();
    assert!(target.writes.contains(&(TESTNEXT_LINE11, vec![TRAP_INSTRUCTION])));
    assert!(target.writes.contains(&(TESTNEXT_LINE15, vec![TRAP_INSTRUCTION])));
    assert!(!target.writes.contains(&(TESTNEXT_LINE10, vec![TRAP_INSTRUCTION])));

    // All temps are gone and their bytes restored.
    assert!(session.find_breakpoint(TESTNEXT_LINE11).is_none());
    assert!(session.find_breakpoint(TESTNEXT_LINE15).is_none());
    assert_eq!(session.target().mem_get(TESTNEXT_LINE11), Some(0xaa));
    assert_eq!(session.target().mem_get(TESTNEXT_LINE15), Some(0xbb));

    // Execution halted on the restored instruction of the line we reached.
    assert_eq!(session.current_pc().unwrap(), TESTNEXT_LINE11);
    assert!(!session.running());
}

#[test]
fn s5_next_at_function_tail_reports_goroutine_exiting() {
    let mut target = testnext_target();
    // Two threads: T1's goroutine is finished (its frame returns into
    // runtime.goexit), T2 sits at the conditional.
    target.add_thread(T2);
    target.set_regs(T1, TESTNEXT_LINE20, SP1);
    target.set_regs(T2, TESTNEXT_LINE10, SP2);
    target.mem_set_word(SP1, GOEXIT_PC); // return address of T1's frame
    seed_goroutine(&mut target, G2, 7, TESTNEXT_LINE10, SP2);
    target.mem_set_word(SP2 + 8, G2);

    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    // First next: issued from T1, whose goroutine is exiting.
    push_getg_stop(session.target_mut(), T1); // current_goroutine(T1)
    push_getg_stop(session.target_mut(), T1); // goexit check re-reads the goroutine
    let result = session.next();
    assert!(matches!(result, Err(Error::GoroutineExiting(42))));
    assert!(!session.running());
    assert!(!session.exited());

    // The session stays live: next on another thread works.
    session.switch_thread(T2).unwrap();
    let target = session.target_mut();
    push_getg_stop(target, T2); // current_goroutine(T2)
    push_getg_stop(target, T1); // T1's goexit check, skipped as non-issuing
    target.push_stop(TraceEvent::Trap(T2), Some((T2, TESTNEXT_LINE11 + 1)));
    push_getg_stop(target, T2); // arrival check

    session.next().unwrap();
    assert_eq!(session.current_pc().unwrap(), TESTNEXT_LINE11);
}

#[test]
fn next_substitutes_return_address_for_uncovered_candidate() {
    let mut data = fixture_data();
    // A candidate line whose pc lies outside the current frame.
    data.add_line(src(), 99, 0x1400);
    data.add_next_lines(src(), 10, &[99]);

    let mut target = testnext_target();
    target.mem_set_word(SP1, 0x1050); // frame's return address, in main.main
    target.mem_set(0x1050, &[0x33]);

    let mut session = Session::attach_with(target, T1, &data).unwrap();

    let target = session.target_mut();
    push_getg_stop(target, T1);
    target.push_stop(TraceEvent::Trap(T1), Some((T1, 0x1051)));
    push_getg_stop(target, T1);

    session.next().unwrap();

    // The temp breakpoint went to the return address, not the uncovered pc.
    assert!(session.target().writes.contains(&(0x1050, vec![TRAP_INSTRUCTION])));
    assert!(!session.target().writes.iter().any(|(addr, _)| *addr == 0x1400));
    assert_eq!(session.current_pc().unwrap(), 0x1050);
}

#[test]
fn continue_through_runtime_breakpoint_steps_back_to_user_code() {
    let mut target = MockTarget::new(&[T1]);
    target.set_regs(T1, 0x0f00, SP1);
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    // Trap inside runtime.breakpoint with no breakpoint installed.
    session
        .target_mut()
        .push_stop(TraceEvent::Trap(T1), Some((T1, 0x4005)));

    session.cont().unwrap();

    // Two single steps return to user code, then the target halts.
    assert_eq!(session.target().stepped, vec![T1, T1]);
    assert_eq!(session.current_pc().unwrap(), 0x4007);
    assert_eq!(session.target().interrupted, vec![T1]);
}

#[test]
fn continue_fails_on_unrecognized_trap() {
    let mut target = MockTarget::new(&[T1]);
    target.set_regs(T1, 0x0f00, SP1);
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    session
        .target_mut()
        .push_stop(TraceEvent::Trap(T1), Some((T1, 0x0999)));

    assert!(matches!(
        session.cont(),
        Err(Error::UnrecognizedTrap { pc: 0x0999 })
    ));
}

#[test]
fn step_skips_blocked_threads() {
    let mut target = MockTarget::new(&[T1, T2]);
    target.set_regs(T1, TESTNEXT_LINE10, SP1);
    target.set_regs(T2, 0x5004, SP2); // parked in runtime.futex
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    session.step().unwrap();
    assert_eq!(session.target().stepped, vec![T1]);
}

#[test]
fn find_location_round_trips() {
    let mut target = MockTarget::new(&[T1]);
    target.set_regs(T1, 0x0f00, SP1);
    target.mem_set(TESTNEXT_LINE11, &[0xaa]);
    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();

    // Every function resolves to its entry.
    for func in session.funcs() {
        assert_eq!(session.find_location(&func.name).unwrap(), func.entry);
    }

    // file:line goes through the symbol table.
    assert_eq!(
        session.find_location(&format!("{SRC}:10")).unwrap(),
        TESTNEXT_LINE10
    );
    assert!(matches!(
        session.find_location(&format!("{SRC}:404")),
        Err(Error::LocationNotFound(_))
    ));

    // A number matching a breakpoint id resolves to its address.
    let bp = session.set_breakpoint(TESTNEXT_LINE11).unwrap();
    assert_eq!(session.find_location("1").unwrap(), bp.addr);

    // Other numbers are raw addresses, in any Go integer literal base.
    assert_eq!(session.find_location("4096").unwrap(), 4096);
    assert_eq!(session.find_location("0x1400").unwrap(), 0x1400);
    assert_eq!(session.find_location("010").unwrap(), 8);

    assert!(matches!(
        session.find_location("no.such.func"),
        Err(Error::LocationNotFound(_))
    ));
}

#[test]
fn clear_by_location_restores_original_byte() {
    let mut session = Session::attach_with(testnext_target(), T1, &fixture_data()).unwrap();

    session.set_breakpoint_at("main.main").unwrap();
    assert_eq!(session.target().mem_get(MAIN_ENTRY), Some(TRAP_INSTRUCTION));

    let bp = session.clear_breakpoint_at("main.main").unwrap();
    assert_eq!(bp.addr, MAIN_ENTRY);
    assert_eq!(session.target().mem_get(MAIN_ENTRY), Some(0x55));
    assert!(session.find_breakpoint(MAIN_ENTRY).is_none());
}

#[test]
fn goroutines_walks_the_runtime_task_list() {
    let mut target = testnext_target();
    seed_goroutine(&mut target, G2, 7, TESTNEXT_LINE20, SP2);

    // allglen = 2, allg -> array of two *g slots.
    target.mem_set_word(0x9000, 2);
    target.mem_set_word(0x9010, 0x9100);
    target.mem_set_word(0x9100, G1);
    target.mem_set_word(0x9108, G2);

    // G2 is parked on a channel receive.
    let reason = b"chan receive";
    target.mem_set(0x7500, reason);
    target.mem_set_word(G2 + 32, 0x7500);
    target.mem_set_word(G2 + 40, reason.len() as u64);

    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();
    let goroutines = session.goroutines().unwrap();

    assert_eq!(goroutines.len(), 2);
    assert_eq!(goroutines[0].id, 42);
    assert_eq!(goroutines[0].file, Path::new(SRC));
    assert_eq!(goroutines[0].line, 10);
    assert_eq!(goroutines[0].wait_reason, "");
    assert_eq!(goroutines[1].id, 7);
    assert_eq!(goroutines[1].line, 20);
    assert_eq!(goroutines[1].wait_reason, "chan receive");
}

#[test]
fn goroutine_walk_never_returns_partial_results() {
    let mut target = testnext_target();
    // Claim three goroutines but only map one slot.
    target.mem_set_word(0x9000, 3);
    target.mem_set_word(0x9010, 0x9100);
    target.mem_set_word(0x9100, G1);

    let mut session = Session::attach_with(target, T1, &fixture_data()).unwrap();
    assert!(matches!(
        session.goroutines(),
        Err(Error::Memory { .. })
    ));
}

#[test]
fn eval_symbol_renders_package_level_variables() {
    let mut data = fixture_data();
    data.variables.insert(
        "main.count".into(),
        VariableDef {
            addr: 0xa000,
            size: 8,
            kind: VariableKind::Int,
            typ: "int".into(),
        },
    );
    data.variables.insert(
        "main.name".into(),
        VariableDef {
            addr: 0xa010,
            size: 16,
            kind: VariableKind::String,
            typ: "string".into(),
        },
    );

    let mut target = testnext_target();
    target.mem_set_word(0xa000, (-5i64) as u64);
    let name = b"tether";
    target.mem_set(0xa100, name);
    target.mem_set_word(0xa010, 0xa100);
    target.mem_set_word(0xa018, name.len() as u64);

    let mut session = Session::attach_with(target, T1, &data).unwrap();

    let count = session.eval_symbol("main.count").unwrap();
    assert_eq!(count.value, "-5");
    assert_eq!(count.typ, "int");

    let name = session.eval_symbol("main.name").unwrap();
    assert_eq!(name.value, "tether");

    assert!(matches!(
        session.eval_symbol("main.missing"),
        Err(Error::SymbolNotFound(_))
    ));
}
