use pixir_vm_runtime::{Devices, ErrorKind, Program, VirtualMachine, VmError};

fn machine(lines: &[&str], functions: &[(&str, usize)]) -> VirtualMachine {
    let mut vm = VirtualMachine::new(Devices::headless());
    let functions = functions
        .iter()
        .map(|(name, address)| ((*name).to_owned(), *address));
    vm.load(Program::from_lines(lines.iter().copied(), functions).expect("program decodes"));
    vm
}

/// Halts with slot 0 set to 5, slot 1 unset, and 1, 2, 3 on the work stack.
fn halted_with_state() -> VirtualMachine {
    let mut vm = machine(
        &[
            "push 2", "alloc", "push 5", "push 0", "push 0", "st", "push 1", "push 2", "push 3",
            "halt",
        ],
        &[(".main", 0)],
    );
    vm.run().expect("runs");
    vm
}

#[test]
fn program_counter() {
    let vm = halted_with_state();
    assert_eq!(vm.query("#PC").unwrap(), "9");
}

#[test]
fn work_stack_queries() {
    let vm = halted_with_state();
    assert_eq!(vm.query("workStack").unwrap(), "[1, 2, 3]");
    assert_eq!(vm.query("workStack.len").unwrap(), "3");
    assert_eq!(vm.query("workStack[0]").unwrap(), "1");
    assert_eq!(vm.query("workStack[1..3]").unwrap(), "[2, 3]");
    assert_eq!(vm.query("workStack[0..0]").unwrap(), "[]");
    assert_eq!(vm.query(" workStack[2] ").unwrap(), "3");
}

#[test]
fn work_stack_index_out_of_range() {
    let vm = halted_with_state();
    let error = vm.query("workStack[3]").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Range);
    assert!(error.to_string().contains("[0, 2]"), "{error}");

    let error = vm.query("workStack[0..4]").unwrap_err();
    assert!(matches!(error, VmError::QueryRange { .. }));
    assert!(vm.query("workStack[-1]").is_err());
}

#[test]
fn reversed_slice_is_a_range_error() {
    let vm = halted_with_state();
    let error = vm.query("workStack[2..1]").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Range);
    assert!(matches!(
        error,
        VmError::QueryRange {
            what: "workStack",
            index: 2,
            max: 1,
        }
    ));
}

#[test]
fn memory_queries() {
    let vm = halted_with_state();
    assert_eq!(vm.query("[0:0]").unwrap(), "5");
    assert_eq!(vm.query("[0]").unwrap(), "5");
    assert_eq!(vm.query("[1:0]").unwrap(), "undefined");
    assert_eq!(vm.query("[:0]").unwrap(), "[5, undefined]");
    assert_eq!(vm.query("[:0].len").unwrap(), "2");
    assert_eq!(vm.query("[:]").unwrap(), "0: [5, undefined]");
    assert_eq!(vm.query("[:].len").unwrap(), "1");
}

#[test]
fn memory_queries_are_bounds_checked() {
    let vm = halted_with_state();
    let error = vm.query("[2:0]").unwrap_err();
    assert!(matches!(
        error,
        VmError::QueryRange {
            what: "location",
            index: 2,
            max: 1,
        }
    ));

    let error = vm.query("[0:1]").unwrap_err();
    assert!(matches!(error, VmError::QueryRange { what: "frame", .. }));
    assert!(vm.query("[:3]").is_err());
}

#[test]
fn return_stack_inside_a_call() {
    let mut vm = machine(
        &["push 0", "push .f", "call", "halt", "push 9", "nop", "ret"],
        &[(".main", 0), (".f", 4)],
    );
    vm.add_breakpoint(6);
    vm.run().expect("runs");

    assert_eq!(vm.query("retStack").unwrap(), "[3]");
    assert_eq!(vm.query("retStack.len").unwrap(), "1");
    assert_eq!(vm.query("retStack[0]").unwrap(), "3");
    assert_eq!(vm.query("[:].len").unwrap(), "2");
    assert_eq!(vm.query("[:]").unwrap(), "0: []\n1: []");
    assert_eq!(vm.query("workStack").unwrap(), "[9]");
}

#[test]
fn malformed_queries_are_syntax_errors() {
    let vm = halted_with_state();
    for query in [
        "pc",
        "workStack[",
        "workStack[a]",
        "workStack.size",
        "[x:0]",
        "[0:]",
        "[0:0].len",
        "[",
    ] {
        let error = vm.query(query).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Syntax, "{query}");
    }
}

#[test]
fn queries_do_not_change_state() {
    let vm = halted_with_state();
    let before = vm.snapshot();
    for query in ["#PC", "workStack", "[:]", "[0:0]", "retStack.len"] {
        vm.query(query).unwrap();
    }
    assert_eq!(vm.snapshot(), before);
}
