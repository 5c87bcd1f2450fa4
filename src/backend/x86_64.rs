use std::collections::BTreeMap;

use crate::{
    backend::{
        CodeGenerator,
        asm::{
            AssemblyProgram, Condition, DataEntry, DataSection, Instruction, Item, Reg,
            TextSection,
        },
    },
    frontend::intern::Symbol,
    index::Index,
    middle::ir::{
        BinaryOp, CompareOp, IrFunction, IrInstruction, IrProgram, LabelId, Operand, TempId,
    },
};

/// Integer argument registers of the System V AMD64 calling convention
const ARG_REGS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Linux exit(2) syscall number
const SYS_EXIT: i64 = 60;

pub struct CodeGeneratorX86_64Linux;

impl CodeGenerator for CodeGeneratorX86_64Linux {
    fn generate(&self, program: &IrProgram) -> AssemblyProgram {
        let mut text = TextSection::default();
        let mut next_label = LabelId::new(program.label_count);

        /* Program entrypoint: call main, then exit with its return value */

        text.items.push(Item::FunctionLabel(Symbol::new("_start")));
        text.items
            .push(Item::Instruction(Instruction::Call(Symbol::new("main"))));
        text.items.push(Item::Instruction(Instruction::MovRegReg {
            destination: Reg::Rdi,
            source: Reg::Rax,
        }));
        text.items.push(Item::Instruction(Instruction::MovRegImm {
            destination: Reg::Rax,
            value: SYS_EXIT,
        }));
        text.items.push(Item::Instruction(Instruction::Syscall));

        /* User code */

        for function in &program.functions {
            codegen_function(program, function, &mut text, &mut next_label);
        }

        AssemblyProgram {
            text,
            data: data_section(program),
            label_count: next_label.index(),
        }
    }
}

/// Serializes global variables into named little-endian blobs, each sized
/// to its declared type
fn data_section(program: &IrProgram) -> Option<DataSection> {
    if program.globals.is_empty() {
        return None;
    }

    let entries = program
        .globals
        .iter()
        .map(|global| DataEntry {
            name: global.name,
            bytes: global.initial_value.unwrap_or(0).to_le_bytes()[..global.ty.size as usize]
                .to_vec(),
        })
        .collect();

    Some(DataSection { entries })
}

fn align_to(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

fn codegen_function(
    program: &IrProgram,
    function: &IrFunction,
    text: &mut TextSection,
    next_label: &mut LabelId,
) {
    assert!(
        function.parameters.len() <= ARG_REGS.len(),
        "function '{}' has {} parameters but only {} register arguments are supported",
        function.name,
        function.parameters.len(),
        ARG_REGS.len()
    );

    /* Frame layout: parameters first, then locals, then temporaries, one
     * 8-byte slot each, addressed as [rbp - offset] */

    let mut slot_offsets = BTreeMap::new();
    let mut frame_top = 0i32;

    for parameter in &function.parameters {
        frame_top += 8;
        slot_offsets.insert(parameter.name, frame_top);
    }

    for name in function.locals.keys() {
        frame_top += 8;
        assert!(
            slot_offsets.insert(*name, frame_top).is_none(),
            "variable '{}' shadows a parameter in function '{}'",
            name,
            function.name
        );
    }

    let temp_base = frame_top;
    let frame_size = align_to(temp_base + 8 * function.temp_count as i32, 16);

    let epilogue_label = *next_label;
    next_label.increment_by(1);

    let mut assembler = FunctionAssembler {
        text,
        function,
        slot_offsets,
        temp_base,
    };

    /* Prologue */

    assembler.function_label(function.name);
    assembler.emit(Instruction::Push(Reg::Rbp));
    assembler.emit(Instruction::MovRegReg {
        destination: Reg::Rbp,
        source: Reg::Rsp,
    });
    assembler.emit(Instruction::SubRegImm {
        destination: Reg::Rsp,
        value: frame_size,
    });

    /* Spill the register arguments into their frame slots */

    for (i, parameter) in function.parameters.iter().enumerate() {
        let offset = assembler.variable_offset(parameter.name);
        assembler.emit(Instruction::MovFrameReg {
            offset,
            source: ARG_REGS[i],
        });
    }

    /* Body */

    for instruction in &function.instructions {
        match instruction {
            IrInstruction::LoadConst { destination, value } => {
                assembler.emit(Instruction::MovRegImm {
                    destination: Reg::Rax,
                    value: *value,
                });
                assembler.store_temp(*destination, Reg::Rax);
            }
            IrInstruction::LoadVar {
                destination,
                variable,
            } => {
                let offset = assembler.variable_offset(*variable);
                assembler.emit(Instruction::MovRegFrame {
                    destination: Reg::Rax,
                    offset,
                });
                assembler.store_temp(*destination, Reg::Rax);
            }
            IrInstruction::StoreVar { variable, source } => {
                assembler.load_operand(Reg::Rax, *source);
                let offset = assembler.variable_offset(*variable);
                assembler.emit(Instruction::MovFrameReg {
                    offset,
                    source: Reg::Rax,
                });
            }
            IrInstruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                assembler.load_operand(Reg::Rax, *lhs);
                assembler.load_operand(Reg::Rcx, *rhs);

                match operator {
                    BinaryOp::Add => assembler.emit(Instruction::AddRegReg {
                        destination: Reg::Rax,
                        source: Reg::Rcx,
                    }),
                    BinaryOp::Subtract => assembler.emit(Instruction::SubRegReg {
                        destination: Reg::Rax,
                        source: Reg::Rcx,
                    }),
                    BinaryOp::Multiply => assembler.emit(Instruction::ImulRegReg {
                        destination: Reg::Rax,
                        source: Reg::Rcx,
                    }),
                    BinaryOp::Divide => {
                        assembler.emit(Instruction::Cqo);
                        assembler.emit(Instruction::IdivReg(Reg::Rcx));
                    }
                    BinaryOp::Modulus => {
                        assembler.emit(Instruction::Cqo);
                        assembler.emit(Instruction::IdivReg(Reg::Rcx));
                        assembler.emit(Instruction::MovRegReg {
                            destination: Reg::Rax,
                            source: Reg::Rdx,
                        });
                    }
                }

                assembler.store_temp(*destination, Reg::Rax);
            }
            IrInstruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                assembler.load_operand(Reg::Rax, *lhs);
                assembler.load_operand(Reg::Rcx, *rhs);
                assembler.emit(Instruction::CmpRegReg {
                    lhs: Reg::Rax,
                    rhs: Reg::Rcx,
                });
                assembler.emit(Instruction::SetCondition {
                    condition: condition_for(*operator),
                    destination: Reg::Rax,
                });
                assembler.emit(Instruction::MovzxRegReg8 {
                    destination: Reg::Rax,
                    source: Reg::Rax,
                });
                assembler.store_temp(*destination, Reg::Rax);
            }
            IrInstruction::Jump { target } => {
                assembler.emit(Instruction::Jmp(*target));
            }
            IrInstruction::JumpIfZero { condition, target } => {
                assembler.load_operand(Reg::Rax, *condition);
                assembler.emit(Instruction::TestRegReg {
                    lhs: Reg::Rax,
                    rhs: Reg::Rax,
                });
                assembler.emit(Instruction::JmpIf {
                    condition: Condition::Equal,
                    target: *target,
                });
            }
            IrInstruction::Label(label) => {
                assembler.label(*label);
            }
            IrInstruction::Call {
                destination,
                callee,
                arguments,
            } => {
                let Some(callee_function) = program.function(*callee) else {
                    panic!(
                        "call to undefined function '{callee}' in function '{}'",
                        function.name
                    )
                };

                assert!(
                    callee_function.parameters.len() == arguments.len(),
                    "call to '{}' with {} argument(s) but it takes {}",
                    callee,
                    arguments.len(),
                    callee_function.parameters.len()
                );
                assert!(
                    arguments.len() <= ARG_REGS.len(),
                    "call to '{}' passes {} arguments but only {} register arguments are supported",
                    callee,
                    arguments.len(),
                    ARG_REGS.len()
                );

                // Every temporary lives in the frame, so nothing is live in a
                // call-clobbered register here; the arguments can be loaded
                // straight into their convention slots
                for (i, argument) in arguments.iter().enumerate() {
                    assembler.load_operand(ARG_REGS[i], *argument);
                }

                assembler.emit(Instruction::Call(*callee));

                if let Some(destination) = destination {
                    assembler.store_temp(*destination, Reg::Rax);
                }
            }
            IrInstruction::Return { value } => {
                if let Some(value) = value {
                    assembler.load_operand(Reg::Rax, *value);
                }

                assembler.emit(Instruction::Jmp(epilogue_label));
            }
        }
    }

    /* Epilogue: the single frame-teardown point every return jumps to */

    assembler.label(epilogue_label);
    assembler.emit(Instruction::MovRegReg {
        destination: Reg::Rsp,
        source: Reg::Rbp,
    });
    assembler.emit(Instruction::Pop(Reg::Rbp));
    assembler.emit(Instruction::Ret);
}

fn condition_for(operator: CompareOp) -> Condition {
    match operator {
        CompareOp::Equal => Condition::Equal,
        CompareOp::NotEqual => Condition::NotEqual,
        CompareOp::LessThan => Condition::LessThan,
        CompareOp::LessThanOrEqual => Condition::LessThanOrEqual,
        CompareOp::GreaterThan => Condition::GreaterThan,
        CompareOp::GreaterThanOrEqual => Condition::GreaterThanOrEqual,
    }
}

struct FunctionAssembler<'a> {
    text: &'a mut TextSection,
    function: &'a IrFunction,
    slot_offsets: BTreeMap<Symbol, i32>,
    temp_base: i32,
}

impl FunctionAssembler<'_> {
    fn emit(&mut self, instruction: Instruction) {
        self.text.items.push(Item::Instruction(instruction));
    }

    fn function_label(&mut self, name: Symbol) {
        self.text.items.push(Item::FunctionLabel(name));
    }

    fn label(&mut self, label: LabelId) {
        self.text.items.push(Item::Label(label));
    }

    fn variable_offset(&self, name: Symbol) -> i32 {
        let Some(offset) = self.slot_offsets.get(&name) else {
            panic!(
                "reference to undefined variable '{name}' in function '{}'",
                self.function.name
            )
        };

        *offset
    }

    fn temp_offset(&self, temp: TempId) -> i32 {
        assert!(
            temp.index() < self.function.temp_count,
            "reference to out-of-range temporary %{} in function '{}'",
            temp.index(),
            self.function.name
        );

        self.temp_base + 8 * (temp.index() as i32 + 1)
    }

    fn load_operand(&mut self, destination: Reg, operand: Operand) {
        match operand {
            Operand::Const(value) => self.emit(Instruction::MovRegImm { destination, value }),
            Operand::Temp(temp) => {
                let offset = self.temp_offset(temp);
                self.emit(Instruction::MovRegFrame {
                    destination,
                    offset,
                });
            }
        }
    }

    fn store_temp(&mut self, temp: TempId, source: Reg) {
        let offset = self.temp_offset(temp);
        self.emit(Instruction::MovFrameReg { offset, source });
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        frontend::{SourceFile, SourceFileOrigin, parser::Parser},
        middle::ast_lowering::IrGenerator,
    };

    fn generate(source: &str) -> AssemblyProgram {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let module = Parser::parse_module(&source);
        let program = IrGenerator::generate(&module);

        CodeGeneratorX86_64Linux.generate(&program)
    }

    fn lines(program: &AssemblyProgram) -> Vec<String> {
        program.text.render().lines().map(str::to_owned).collect()
    }

    #[test]
    fn emits_entry_stub_first() {
        let program = generate("int main() { return 42; }");
        let lines = lines(&program);

        assert_eq!(
            &lines[..5],
            &[
                "_start:",
                "    call main",
                "    mov rdi, rax",
                "    mov rax, 60",
                "    syscall",
            ]
        );
    }

    #[test]
    fn prologue_and_epilogue_are_symmetric() {
        let program = generate("int main() { return 42; }");
        let rendered = program.text.render();

        // One temporary slot rounded up to a 16-byte frame
        assert!(rendered.contains(indoc! {"
            main:
                push rbp
                mov rbp, rsp
                sub rsp, 16"}));
        assert!(rendered.ends_with(indoc! {"
            .L0:
                mov rsp, rbp
                pop rbp
                ret"}));
    }

    #[test]
    fn every_return_path_jumps_to_the_one_epilogue() {
        let program = generate(indoc! {"
            int main()
            {
                int x = 1;
                if (x) { return 2; }
                return 3;
            }
        "});
        let rendered = program.text.render();

        let epilogue_jumps = rendered.matches("jmp .L1").count();
        let rets = rendered.matches("\n    ret").count();

        // Both returns share the function epilogue label (.L0 is taken by
        // the if statement's end label)
        assert_eq!(epilogue_jumps, 2);
        assert_eq!(rets, 1);
    }

    #[test]
    fn spills_parameters_into_frame_slots() {
        let program = generate(indoc! {"
            int add(int a, int b)
            {
                return a + b;
            }

            int main()
            {
                return add(5, 7);
            }
        "});
        let rendered = program.text.render();

        assert!(rendered.contains(indoc! {"
            add:
                push rbp
                mov rbp, rsp
                sub rsp, 48
                mov [rbp - 8], rdi
                mov [rbp - 16], rsi"}));
    }

    #[test]
    fn loads_call_arguments_into_convention_registers() {
        let program = generate(indoc! {"
            int add(int a, int b)
            {
                return a + b;
            }

            int main()
            {
                return add(5, 7);
            }
        "});
        let rendered = program.text.render();

        let call_site = rendered
            .find("call add")
            .expect("main should call add");
        let before_call = &rendered[..call_site];

        assert!(before_call.contains("mov rdi, [rbp - "));
        assert!(before_call.contains("mov rsi, [rbp - "));
    }

    #[test]
    fn division_uses_sign_extended_idiv() {
        let program = generate("int main() { return 7 / 2; }");
        let rendered = program.text.render();

        assert!(rendered.contains("    cqo\n    idiv rcx"));
    }

    #[test]
    fn modulus_moves_remainder_out_of_rdx() {
        let program = generate("int main() { return 7 % 2; }");
        let rendered = program.text.render();

        assert!(rendered.contains("    cqo\n    idiv rcx\n    mov rax, rdx"));
    }

    #[test]
    fn comparison_materializes_a_flag_byte() {
        let program = generate("int main() { return 1 < 2; }");
        let rendered = program.text.render();

        assert!(rendered.contains("    cmp rax, rcx\n    setl al\n    movzx rax, al"));
    }

    #[test]
    fn globals_serialize_into_the_data_section() {
        let program = generate(indoc! {"
            int counter = 5;
            long wide = -1;
            short flag;

            int main() { return 0; }
        "});
        let data = program.data.expect("expected a data section");

        assert_eq!(
            data.to_bytes(),
            [
                [5u8, 0, 0, 0].as_slice(),
                [0xFF; 8].as_slice(),
                [0, 0].as_slice(),
            ]
            .concat()
        );
    }

    #[test]
    fn programs_without_globals_have_no_data_section() {
        let program = generate("int main() { return 0; }");

        assert!(program.data.is_none());
    }

    #[test]
    #[should_panic(expected = "reference to undefined variable")]
    fn dangling_variable_reference_is_a_contract_violation() {
        use std::collections::BTreeMap;

        // Hand-built IR that references a variable absent from the map,
        // bypassing the frontend's name checks
        let program = IrProgram {
            globals: Vec::new(),
            functions: vec![IrFunction {
                name: Symbol::new("main"),
                return_type: crate::middle::ir::IrType::INT,
                parameters: Vec::new(),
                locals: BTreeMap::new(),
                temp_count: 1,
                instructions: vec![IrInstruction::LoadVar {
                    destination: TempId::new(0),
                    variable: Symbol::new("ghost"),
                }],
            }],
            label_count: 0,
        };

        CodeGeneratorX86_64Linux.generate(&program);
    }

    #[test]
    #[should_panic(expected = "call to undefined function")]
    fn call_to_undefined_function_is_a_contract_violation() {
        use std::collections::BTreeMap;

        let program = IrProgram {
            globals: Vec::new(),
            functions: vec![IrFunction {
                name: Symbol::new("main"),
                return_type: crate::middle::ir::IrType::INT,
                parameters: Vec::new(),
                locals: BTreeMap::new(),
                temp_count: 1,
                instructions: vec![IrInstruction::Call {
                    destination: Some(TempId::new(0)),
                    callee: Symbol::new("missing"),
                    arguments: Vec::new(),
                }],
            }],
            label_count: 0,
        };

        CodeGeneratorX86_64Linux.generate(&program);
    }
}
