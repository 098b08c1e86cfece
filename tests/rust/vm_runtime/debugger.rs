use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pixir_vm_runtime::host::NoKeys;
use pixir_vm_runtime::{
    Devices, ErrorKind, PixelBuffer, Program, SharedLog, VirtualMachine, VmConfig, VmError,
    VmEvent,
};

fn machine(lines: &[&str], functions: &[(&str, usize)]) -> (VirtualMachine, SharedLog) {
    let log = SharedLog::new();
    let devices = Devices::new(PixelBuffer::new(100, 100), log.clone(), NoKeys);
    let config = VmConfig::default().with_key_poll_interval(Duration::from_millis(5));
    let mut vm = VirtualMachine::with_config(devices, config).expect("valid config");
    let functions = functions
        .iter()
        .map(|(name, address)| ((*name).to_owned(), *address));
    vm.load(Program::from_lines(lines.iter().copied(), functions).expect("program decodes"));
    (vm, log)
}

const SUM: &[&str] = &["push 1", "push 2", "add", "print", "halt"];

/// Calls `.f`, which returns straight away, then prints 7.
const CALLER: &[&str] = &[
    "push 0", "push .f", "call", "push 7", "print", "halt", "nop", "nop", "ret",
];

#[test]
fn breakpoint_pauses_before_the_instruction() {
    let (mut vm, log) = machine(SUM, &[(".main", 0)]);
    assert!(vm.add_breakpoint(3));
    vm.run().expect("runs");

    assert!(vm.is_paused());
    assert!(!vm.is_halted());
    assert_eq!(vm.program_counter(), 2);
    assert_eq!(vm.work_stack().len(), 2);
    assert_eq!(log.contents(), "");

    vm.resume().expect("resumes");
    assert!(vm.is_halted());
    assert_eq!(log.contents(), "3\n");
}

#[test]
fn breakpoint_is_hit_again_on_the_next_run() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.add_breakpoint(4);
    vm.run().expect("runs");
    assert_eq!(vm.program_counter(), 3);
    vm.resume().expect("resumes");
    assert!(vm.is_halted());

    vm.run().expect("runs again");
    assert!(vm.is_paused());
    assert_eq!(vm.program_counter(), 3);
}

#[test]
fn breakpoint_bookkeeping() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    assert!(vm.add_breakpoint(5));
    assert!(vm.add_breakpoint(2));
    assert!(!vm.add_breakpoint(5));
    assert!(vm.has_breakpoint(2));
    assert_eq!(vm.breakpoints().collect::<Vec<_>>(), vec![2, 5]);

    assert!(vm.remove_breakpoint(2));
    assert!(!vm.remove_breakpoint(2));
    vm.clear_breakpoints();
    assert_eq!(vm.breakpoints().count(), 0);
}

#[test]
fn breakpoints_survive_reset_and_load() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.add_breakpoint(3);
    vm.reset();
    vm.load(Program::default());
    assert!(vm.has_breakpoint(3));
}

#[test]
fn resume_requires_a_live_machine() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    let error = vm.resume().expect_err("halted");
    assert!(matches!(error, VmError::InvalidControlState(_)));
    assert_eq!(error.kind(), ErrorKind::Runtime);
}

#[test]
fn safe_step_from_halted_starts_a_paused_run() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.safe_step().expect("steps");
    assert!(vm.is_paused());
    assert!(!vm.is_halted());
    assert_eq!(vm.program_counter(), 1);

    vm.safe_step().expect("steps");
    vm.safe_step().expect("steps");
    assert_eq!(vm.program_counter(), 3);
    assert_eq!(vm.work_stack().len(), 1);
}

#[test]
fn safe_step_onto_halt_halts() {
    let (mut vm, log) = machine(SUM, &[(".main", 0)]);
    for _ in 0..5 {
        vm.safe_step().expect("steps");
    }
    assert!(vm.is_halted());
    assert_eq!(log.contents(), "3\n");

    vm.safe_step().expect("restarts");
    assert_eq!(vm.program_counter(), 1);
    assert_eq!(vm.work_stack().len(), 1);
}

#[test]
fn step_out_runs_until_the_function_returns() {
    let (mut vm, log) = machine(CALLER, &[(".main", 0), (".f", 6)]);
    vm.add_breakpoint(8);
    vm.run().expect("runs");
    assert_eq!(vm.program_counter(), 7);
    assert_eq!(vm.ret_stack(), &[3]);

    vm.step_out().expect("steps out");
    assert!(vm.is_paused());
    assert_eq!(vm.program_counter(), 3);
    assert!(vm.ret_stack().is_empty());
    assert_eq!(log.contents(), "");

    vm.resume().expect("resumes");
    assert_eq!(log.contents(), "7\n");
}

#[test]
fn step_out_at_top_level_runs_to_completion() {
    let (mut vm, log) = machine(SUM, &[(".main", 0)]);
    vm.safe_step().expect("steps");
    vm.step_out().expect("steps out");
    assert!(vm.is_halted());
    assert!(!vm.is_paused());
    assert_eq!(log.contents(), "3\n");
}

#[test]
fn step_out_stops_at_breakpoints() {
    let (mut vm, _) = machine(CALLER, &[(".main", 0), (".f", 6)]);
    vm.safe_step().expect("steps");
    vm.add_breakpoint(5);
    vm.step_out().expect("steps out");
    assert!(vm.is_paused());
    assert_eq!(vm.program_counter(), 4);
}

#[test]
fn events_report_state_changes_in_order() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    let events = vm.events();
    vm.run().expect("runs");

    let seen: Vec<VmEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            VmEvent::PausedChanged(false),
            VmEvent::HaltedChanged(false),
            VmEvent::PausedChanged(false),
            VmEvent::HaltedChanged(true),
        ]
    );
}

#[test]
fn breakpoint_hit_follows_the_pause_event() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.add_breakpoint(3);
    let events = vm.events();
    vm.run().expect("runs");

    let seen: Vec<VmEvent> = events.try_iter().collect();
    assert_eq!(
        &seen[seen.len() - 2..],
        &[
            VmEvent::PausedChanged(true),
            VmEvent::BreakpointHit { address: 3 },
        ]
    );
}

#[test]
fn dropped_event_streams_are_unsubscribed() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    for _ in 0..3 {
        drop(vm.events());
    }
    let live = vm.events();
    assert_eq!(vm.observer_count(), 4);

    vm.run().expect("runs");
    assert_eq!(vm.observer_count(), 1);
    assert_eq!(live.try_iter().last(), Some(VmEvent::HaltedChanged(true)));

    drop(live);
    vm.run().expect("runs again");
    assert_eq!(vm.observer_count(), 0);
}

#[test]
fn observers_run_in_registration_order() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    let calls = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let calls = Arc::clone(&calls);
        vm.subscribe(move |event: &VmEvent| {
            if *event == VmEvent::HaltedChanged(true) {
                calls.lock().unwrap().push(name);
            }
        });
    }
    assert_eq!(vm.observer_count(), 2);

    vm.run().expect("runs");
    assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn failing_instruction_notifies_halt() {
    let (mut vm, _) = machine(&["push 1", "add"], &[(".main", 0)]);
    let events = vm.events();
    assert!(vm.run().is_err());
    assert_eq!(events.try_iter().last(), Some(VmEvent::HaltedChanged(true)));
}

#[test]
fn pause_and_stop_set_the_flags() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.safe_step().expect("steps");
    vm.stop();
    assert!(vm.is_halted());

    vm.pause();
    assert!(vm.is_paused());
}

#[test]
fn stop_request_interrupts_getchar() {
    let (mut vm, _) = machine(&["getchar", "halt"], &[(".main", 0)]);
    let handle = vm.control_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    vm.run().expect("interrupted cleanly");
    stopper.join().unwrap();
    assert!(vm.is_halted());
    assert_eq!(vm.program_counter(), 0);
    assert!(vm.work_stack().is_empty());
}

#[test]
fn pause_request_interrupts_getchar() {
    let (mut vm, _) = machine(&["getchar", "halt"], &[(".main", 0)]);
    let handle = vm.control_handle();
    let pauser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.pause();
    });

    vm.run().expect("interrupted cleanly");
    pauser.join().unwrap();
    assert!(vm.is_paused());
    assert!(!vm.is_halted());
    assert_eq!(vm.program_counter(), 0);
}

#[test]
fn stale_requests_are_discarded_by_run() {
    let (mut vm, log) = machine(SUM, &[(".main", 0)]);
    let handle = vm.control_handle();
    handle.pause();
    handle.stop();
    assert!(handle.is_pending());

    vm.run().expect("runs");
    assert!(!handle.is_pending());
    assert_eq!(log.contents(), "3\n");
}

#[test]
fn screen_size_changes_only_while_halted() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.set_width(50).expect("halted resize");
    vm.set_height(25).expect("halted resize");
    assert_eq!((vm.width(), vm.height()), (50, 25));

    let error = vm.set_width(101).expect_err("wider than surface");
    assert_eq!(error.kind(), ErrorKind::Range);
    assert!(vm.set_height(0).is_err());

    vm.safe_step().expect("steps");
    let error = vm.set_width(10).expect_err("paused");
    assert!(matches!(error, VmError::InvalidControlState(_)));
}

#[test]
fn reset_clears_stacks_but_keeps_the_program() {
    let (mut vm, _) = machine(SUM, &[(".main", 0)]);
    vm.safe_step().expect("steps");
    vm.safe_step().expect("steps");
    vm.reset();
    assert!(vm.work_stack().is_empty());
    assert_eq!(vm.program_counter(), 0);
    assert!(!vm.is_paused());
    assert_eq!(vm.program().len(), SUM.len());
    assert_eq!(vm.frames().len(), 1);
}
