use pixir_vm_runtime::bytecode::{
    colour_to_hex, decode_instruction, hex_to_colour, parse_operand, validate_function_name,
    DecodeError, Instruction, Opcode, Program,
};
use pixir_vm_runtime::memory::{format_number, Value};
use pixir_vm_runtime::ErrorKind;

#[test]
fn parses_numeric_operands() {
    assert_eq!(parse_operand("42").unwrap(), Value::Number(42.0));
    assert_eq!(parse_operand("-3.5").unwrap(), Value::Number(-3.5));
    assert_eq!(parse_operand("1e3").unwrap(), Value::Number(1000.0));
    assert_eq!(parse_operand(".5").unwrap(), Value::Number(0.5));
}

#[test]
fn rejects_nan_and_infinity_spellings() {
    for text in ["NaN", "nan", "inf", "Infinity", "-inf"] {
        assert!(parse_operand(text).is_err(), "{text} should not parse");
    }
}

#[test]
fn parses_function_names() {
    assert_eq!(
        parse_operand(".main").unwrap(),
        Value::Function(".main".to_owned())
    );
    assert!(matches!(
        parse_operand(".bad-name"),
        Err(DecodeError::InvalidFunctionName(_))
    ));
}

#[test]
fn parses_labels_with_and_without_frame() {
    assert_eq!(
        parse_operand("[3:1]").unwrap(),
        Value::Label { offset: 3, frame: 1 }
    );
    assert_eq!(
        parse_operand("[4]").unwrap(),
        Value::Label { offset: 4, frame: 0 }
    );
    assert_eq!(
        parse_operand("+[2:0]").unwrap(),
        Value::LabelWithOffset { offset: 2, frame: 0 }
    );
    assert!(matches!(
        parse_operand("[a:b]"),
        Err(DecodeError::InvalidLabel(_))
    ));
}

#[test]
fn parses_pc_offsets() {
    assert_eq!(parse_operand("#PC+3").unwrap(), Value::PcOffset(3));
    assert_eq!(parse_operand("#PC-2").unwrap(), Value::PcOffset(-2));
    assert!(matches!(
        parse_operand("#PCx"),
        Err(DecodeError::InvalidPcOffset(_))
    ));
}

#[test]
fn parses_colour_literals_as_numbers() {
    assert_eq!(parse_operand("#ff0000").unwrap(), Value::Number(16_711_680.0));
    assert_eq!(parse_operand("#00FF00").unwrap(), Value::Number(65_280.0));
    assert!(matches!(
        parse_operand("#zzzzzz"),
        Err(DecodeError::InvalidColour(_))
    ));
}

#[test]
fn unknown_operand_is_a_syntax_error() {
    let error = parse_operand("banana").unwrap_err();
    assert_eq!(error, DecodeError::InvalidOperand("banana".to_owned()));
    assert_eq!(error.kind(), ErrorKind::Syntax);
}

#[test]
fn decodes_instructions_case_insensitively() {
    assert_eq!(
        decode_instruction("PUSH 7").unwrap(),
        Instruction::with_operand(Opcode::Push, Value::Number(7.0))
    );
    assert_eq!(
        decode_instruction("  Halt  ").unwrap(),
        Instruction::new(Opcode::Halt)
    );
}

#[test]
fn push_operand_count_is_enforced() {
    assert_eq!(
        decode_instruction("push").unwrap_err(),
        DecodeError::MissingOperand(Opcode::Push)
    );
    assert_eq!(
        decode_instruction("push 1 2").unwrap_err(),
        DecodeError::ExtraOperands(Opcode::Push)
    );
}

#[test]
fn pusha_requires_a_label() {
    assert_eq!(
        decode_instruction("pusha [1:2]").unwrap(),
        Instruction::with_operand(Opcode::Pusha, Value::Label { offset: 1, frame: 2 })
    );
    let error = decode_instruction("pusha 5").unwrap_err();
    assert!(matches!(error, DecodeError::ExpectedLocation { .. }));
    assert!(error.to_string().contains("[offset:frame]"));
}

#[test]
fn operand_on_plain_opcode_is_rejected() {
    assert!(matches!(
        decode_instruction("add 1"),
        Err(DecodeError::UnexpectedOperand {
            opcode: Opcode::Add,
            ..
        })
    ));
}

#[test]
fn unknown_opcode_is_rejected() {
    let error = decode_instruction("jump 3").unwrap_err();
    assert_eq!(error, DecodeError::UnknownOpcode("jump".to_owned()));
    assert_eq!(decode_instruction("   ").unwrap_err(), DecodeError::EmptyLine);
}

#[test]
fn every_mnemonic_round_trips_through_from_str() {
    assert_eq!(Opcode::ALL.len(), 49);
    for opcode in Opcode::ALL {
        assert_eq!(opcode.mnemonic().parse::<Opcode>().unwrap(), opcode);
    }
}

#[test]
fn colour_hex_helpers() {
    assert_eq!(colour_to_hex(0).unwrap(), "#000000");
    assert_eq!(colour_to_hex(0xabcdef).unwrap(), "#abcdef");
    let error = colour_to_hex(0x1000000).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Range);
    assert!(colour_to_hex(-1).is_err());

    assert_eq!(hex_to_colour("#0000ff").unwrap(), 255);
    assert!(hex_to_colour("0000ff").is_err());
    assert!(hex_to_colour("#0000f").is_err());
}

#[test]
fn function_name_validation() {
    assert!(validate_function_name(".main").is_ok());
    assert!(validate_function_name(".a_1").is_ok());
    assert!(validate_function_name(".").is_err());
    assert!(validate_function_name("main").is_err());
    assert!(validate_function_name(".a b").is_err());
}

#[test]
fn program_from_lines_reports_the_failing_line() {
    let error = Program::from_lines(["push 1", "bogus"], Vec::new()).unwrap_err();
    assert!(matches!(error, DecodeError::Line { line: 2, .. }));
    assert_eq!(error.kind(), ErrorKind::Syntax);
    assert!(error.to_string().starts_with("line 2:"));
}

#[test]
fn program_from_lines_validates_function_table() {
    let error = Program::from_lines(["halt"], vec![("main".to_owned(), 0)]).unwrap_err();
    assert!(matches!(error, DecodeError::InvalidFunctionName(_)));
}

#[test]
fn default_program_halts_immediately() {
    let program = Program::default();
    assert_eq!(program.len(), 1);
    assert_eq!(program.instruction(0), Some(&Instruction::new(Opcode::Halt)));
    assert_eq!(program.function_address(".main"), Some(0));
}

#[test]
fn instructions_display_like_source_text() {
    let instruction = decode_instruction("push +[1:2]").unwrap();
    assert_eq!(instruction.to_string(), "push +[1:2]");
    assert_eq!(decode_instruction("push #PC-1").unwrap().to_string(), "push #PC-1");
    assert_eq!(decode_instruction("cframe").unwrap().to_string(), "cframe");
}

#[test]
fn values_display_like_program_output() {
    assert_eq!(Value::Number(3.0).to_string(), "3");
    assert_eq!(Value::Number(-0.0).to_string(), "0");
    assert_eq!(Value::Number(0.5).to_string(), "0.5");
    assert_eq!(format_number(f64::NAN), "NaN");
    assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    assert_eq!(
        Value::Array(vec![Some(Value::Number(1.0)), None]).to_string(),
        "[1,undefined]"
    );
    assert_eq!(Value::Function(".f".to_owned()).to_string(), ".f");
}
