//! x86-64 instruction encoding.
//!
//! Instructions follow the general format:
//!
//! ```text
//! [REX] [Opcode] [ModR/M] [Displacement] [Immediate]
//! ```
//!
//! Label references are resolved in two passes: the first assigns a byte
//! offset to every label and function symbol by summing per-instruction
//! encoded lengths, the second emits the bytes with the now-known rel32
//! displacements.

use hashbrown::HashMap;

use crate::{
    backend::asm::{Instruction, Item, Reg, TextSection},
    frontend::intern::Symbol,
    index::{Index, IndexVec},
    middle::ir::LabelId,
};

/// Encodes the text section into raw machine code bytes.
///
/// Pure: identical input always produces identical bytes. A reference to a
/// label or symbol that never appears in the stream is a contract violation
/// by the code generator and panics.
pub fn encode(text: &TextSection, label_count: usize) -> Vec<u8> {
    /* First pass: assign byte offsets to labels and function symbols */

    let mut label_offsets: IndexVec<LabelId, Option<usize>> =
        IndexVec::empty_slots(label_count);
    let mut symbol_offsets: HashMap<Symbol, usize> = HashMap::new();
    let mut offset = 0;

    for item in &text.items {
        match item {
            Item::FunctionLabel(name) => {
                let previous = symbol_offsets.insert(*name, offset);
                assert!(previous.is_none(), "duplicate function label '{name}'");
            }
            Item::Label(label) => {
                let Some(slot) = label_offsets.get_mut(*label) else {
                    panic!("label {label} is outside the program's label space")
                };
                *slot = Some(offset);
            }
            Item::Instruction(instruction) => offset += encoded_length(instruction),
        }
    }

    /* Second pass: emit, substituting resolved displacements */

    let resolver = LabelResolver {
        label_offsets,
        symbol_offsets,
    };

    let mut buffer = CodeBuffer::with_capacity(offset);

    for item in &text.items {
        if let Item::Instruction(instruction) = item {
            emit_instruction(&mut buffer, instruction, &resolver);
        }
    }

    assert_eq!(
        buffer.offset(),
        offset,
        "emitted byte count disagrees with the first-pass lengths"
    );

    buffer.into_code()
}

struct LabelResolver {
    label_offsets: IndexVec<LabelId, Option<usize>>,
    symbol_offsets: HashMap<Symbol, usize>,
}

impl LabelResolver {
    fn label_offset(&self, label: LabelId) -> usize {
        let Some(Some(offset)) = self.label_offsets.get(label) else {
            panic!("jump to undefined label {label}")
        };

        *offset
    }

    fn symbol_offset(&self, name: Symbol) -> usize {
        let Some(offset) = self.symbol_offsets.get(&name) else {
            panic!("call to undefined symbol '{name}'")
        };

        *offset
    }
}

/// Displacement from the end of the current instruction to the target
fn rel32(target: usize, end_of_instruction: usize) -> i32 {
    let displacement = target as i64 - end_of_instruction as i64;

    i32::try_from(displacement).expect("jump displacement out of rel32 range")
}

fn fits_in_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// Whether an 8-bit register operand forces a REX prefix (spl/bpl/sil/dil
/// are only addressable with one)
fn low8_needs_rex(reg: Reg) -> bool {
    reg.needs_rex_ext() || matches!(reg, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
}

/// Encoded byte length of one instruction. Must agree exactly with
/// [`emit_instruction`]; the encoder asserts the totals match.
fn encoded_length(instruction: &Instruction) -> usize {
    match instruction {
        Instruction::Push(reg) | Instruction::Pop(reg) => 1 + reg.needs_rex_ext() as usize,
        Instruction::MovRegReg { .. } => 3,
        Instruction::MovRegImm { value, .. } => {
            if fits_in_i32(*value) {
                7 // REX.W C7 /0 imm32
            } else {
                10 // REX.W B8+rd imm64
            }
        }
        Instruction::MovRegFrame { .. } | Instruction::MovFrameReg { .. } => 7,
        Instruction::AddRegReg { .. }
        | Instruction::SubRegReg { .. }
        | Instruction::CmpRegReg { .. }
        | Instruction::TestRegReg { .. } => 3,
        Instruction::ImulRegReg { .. } => 4,
        Instruction::SubRegImm { .. } => 7,
        Instruction::Cqo => 2,
        Instruction::IdivReg(_) => 3,
        Instruction::SetCondition { destination, .. } => {
            3 + low8_needs_rex(*destination) as usize
        }
        Instruction::MovzxRegReg8 { .. } => 4,
        Instruction::Jmp(_) | Instruction::Call(_) => 5,
        Instruction::JmpIf { .. } => 6,
        Instruction::Ret => 1,
        Instruction::Syscall => 2,
    }
}

fn emit_instruction(buffer: &mut CodeBuffer, instruction: &Instruction, resolver: &LabelResolver) {
    match *instruction {
        Instruction::Push(reg) => {
            if reg.needs_rex_ext() {
                buffer.emit(Rex::new().b().encode());
            }
            buffer.emit(0x50 + reg.encoding());
        }
        Instruction::Pop(reg) => {
            if reg.needs_rex_ext() {
                buffer.emit(Rex::new().b().encode());
            }
            buffer.emit(0x58 + reg.encoding());
        }
        Instruction::MovRegReg {
            destination,
            source,
        } => {
            buffer.emit(Rex::new().w().r_for(source).b_for(destination).encode());
            buffer.emit(0x89); // 89 /r
            buffer.emit(ModRM::reg_reg(source.encoding(), destination.encoding()).encode());
        }
        Instruction::MovRegImm { destination, value } => {
            buffer.emit(Rex::new().w().b_for(destination).encode());

            if fits_in_i32(value) {
                buffer.emit(0xC7); // C7 /0 imm32 (sign-extended)
                buffer.emit(ModRM::reg_opext(0, destination.encoding()).encode());
                buffer.emit_i32(value as i32);
            } else {
                buffer.emit(0xB8 + destination.encoding()); // B8+rd imm64
                buffer.emit_u64(value as u64);
            }
        }
        Instruction::MovRegFrame {
            destination,
            offset,
        } => {
            buffer.emit(Rex::new().w().r_for(destination).encode());
            buffer.emit(0x8B); // 8B /r
            buffer.emit(ModRM::frame_disp32(destination.encoding()).encode());
            buffer.emit_i32(-offset);
        }
        Instruction::MovFrameReg { offset, source } => {
            buffer.emit(Rex::new().w().r_for(source).encode());
            buffer.emit(0x89); // 89 /r
            buffer.emit(ModRM::frame_disp32(source.encoding()).encode());
            buffer.emit_i32(-offset);
        }
        Instruction::AddRegReg {
            destination,
            source,
        } => {
            buffer.emit(Rex::new().w().r_for(source).b_for(destination).encode());
            buffer.emit(0x01); // 01 /r
            buffer.emit(ModRM::reg_reg(source.encoding(), destination.encoding()).encode());
        }
        Instruction::SubRegReg {
            destination,
            source,
        } => {
            buffer.emit(Rex::new().w().r_for(source).b_for(destination).encode());
            buffer.emit(0x29); // 29 /r
            buffer.emit(ModRM::reg_reg(source.encoding(), destination.encoding()).encode());
        }
        Instruction::ImulRegReg {
            destination,
            source,
        } => {
            buffer.emit(Rex::new().w().r_for(destination).b_for(source).encode());
            buffer.emit(0x0F);
            buffer.emit(0xAF); // 0F AF /r
            buffer.emit(ModRM::reg_reg(destination.encoding(), source.encoding()).encode());
        }
        Instruction::SubRegImm { destination, value } => {
            buffer.emit(Rex::new().w().b_for(destination).encode());
            buffer.emit(0x81); // 81 /5 imm32
            buffer.emit(ModRM::reg_opext(5, destination.encoding()).encode());
            buffer.emit_i32(value);
        }
        Instruction::Cqo => {
            buffer.emit(Rex::new().w().encode());
            buffer.emit(0x99);
        }
        Instruction::IdivReg(divisor) => {
            buffer.emit(Rex::new().w().b_for(divisor).encode());
            buffer.emit(0xF7); // F7 /7
            buffer.emit(ModRM::reg_opext(7, divisor.encoding()).encode());
        }
        Instruction::CmpRegReg { lhs, rhs } => {
            buffer.emit(Rex::new().w().r_for(rhs).b_for(lhs).encode());
            buffer.emit(0x39); // 39 /r
            buffer.emit(ModRM::reg_reg(rhs.encoding(), lhs.encoding()).encode());
        }
        Instruction::TestRegReg { lhs, rhs } => {
            buffer.emit(Rex::new().w().r_for(rhs).b_for(lhs).encode());
            buffer.emit(0x85); // 85 /r
            buffer.emit(ModRM::reg_reg(rhs.encoding(), lhs.encoding()).encode());
        }
        Instruction::SetCondition {
            condition,
            destination,
        } => {
            if low8_needs_rex(destination) {
                buffer.emit(Rex::new().b_for(destination).encode());
            }
            buffer.emit(0x0F);
            buffer.emit(0x90 + condition.code()); // 0F 90+cc /0
            buffer.emit(ModRM::reg_opext(0, destination.encoding()).encode());
        }
        Instruction::MovzxRegReg8 {
            destination,
            source,
        } => {
            buffer.emit(Rex::new().w().r_for(destination).b_for(source).encode());
            buffer.emit(0x0F);
            buffer.emit(0xB6); // 0F B6 /r
            buffer.emit(ModRM::reg_reg(destination.encoding(), source.encoding()).encode());
        }
        Instruction::Jmp(target) => {
            buffer.emit(0xE9); // E9 cd
            let end = buffer.offset() + 4;
            buffer.emit_i32(rel32(resolver.label_offset(target), end));
        }
        Instruction::JmpIf { condition, target } => {
            buffer.emit(0x0F);
            buffer.emit(0x80 + condition.code()); // 0F 80+cc cd
            let end = buffer.offset() + 4;
            buffer.emit_i32(rel32(resolver.label_offset(target), end));
        }
        Instruction::Call(name) => {
            buffer.emit(0xE8); // E8 cd
            let end = buffer.offset() + 4;
            buffer.emit_i32(rel32(resolver.symbol_offset(name), end));
        }
        Instruction::Ret => buffer.emit(0xC3),
        Instruction::Syscall => {
            buffer.emit(0x0F);
            buffer.emit(0x05);
        }
    }
}

/// Machine code output buffer
#[derive(Debug, Default)]
struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset
    #[inline]
    fn offset(&self) -> usize {
        self.code.len()
    }

    #[inline]
    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension (unused; no SIB forms are emitted)
    b: bool, // ModR/M r/m extension
}

impl Rex {
    fn new() -> Self {
        Self::default()
    }

    fn w(mut self) -> Self {
        self.w = true;
        self
    }

    fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Set R when the register in the ModR/M reg field is r8-r15
    fn r_for(mut self, reg: Reg) -> Self {
        self.r = reg.needs_rex_ext();
        self
    }

    /// Set B when the register in the ModR/M r/m field is r8-r15
    fn b_for(mut self, reg: Reg) -> Self {
        self.b = reg.needs_rex_ext();
        self
    }

    /// Encode to byte (0x40-0x4F)
    fn encode(self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | self.b as u8
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Register-to-register form (mod=11)
    fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Register with opcode extension (mod=11)
    fn reg_opext(opext: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: opext & 0x07,
            rm: rm & 0x07,
        }
    }

    /// rbp-relative with 32-bit displacement (mod=10, rm=101)
    fn frame_disp32(reg: u8) -> Self {
        Self {
            mod_: 0b10,
            reg: reg & 0x07,
            rm: 0b101,
        }
    }

    fn encode(self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::asm::{Condition, Instruction, Item, Reg};

    fn encode_instructions(instructions: Vec<Instruction>) -> Vec<u8> {
        let text = TextSection {
            items: instructions.into_iter().map(Item::Instruction).collect(),
        };

        encode(&text, 0)
    }

    #[test]
    fn encodes_push_pop() {
        assert_eq!(
            encode_instructions(vec![
                Instruction::Push(Reg::Rbp),
                Instruction::Pop(Reg::Rbp),
                Instruction::Push(Reg::R8),
            ]),
            vec![0x55, 0x5D, 0x41, 0x50]
        );
    }

    #[test]
    fn encodes_mov_reg_reg() {
        // mov rbp, rsp / mov rdi, rax
        assert_eq!(
            encode_instructions(vec![
                Instruction::MovRegReg {
                    destination: Reg::Rbp,
                    source: Reg::Rsp,
                },
                Instruction::MovRegReg {
                    destination: Reg::Rdi,
                    source: Reg::Rax,
                },
            ]),
            vec![0x48, 0x89, 0xE5, 0x48, 0x89, 0xC7]
        );
    }

    #[test]
    fn encodes_mov_immediates() {
        // mov rax, 60 (imm32 form)
        assert_eq!(
            encode_instructions(vec![Instruction::MovRegImm {
                destination: Reg::Rax,
                value: 60,
            }]),
            vec![0x48, 0xC7, 0xC0, 60, 0, 0, 0]
        );

        // movabs rax, 0x1_0000_0000 (imm64 form)
        assert_eq!(
            encode_instructions(vec![Instruction::MovRegImm {
                destination: Reg::Rax,
                value: 0x1_0000_0000,
            }]),
            vec![0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn encodes_frame_accesses() {
        // mov rax, [rbp - 8]
        assert_eq!(
            encode_instructions(vec![Instruction::MovRegFrame {
                destination: Reg::Rax,
                offset: 8,
            }]),
            vec![0x48, 0x8B, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );

        // mov [rbp - 16], rdi
        assert_eq!(
            encode_instructions(vec![Instruction::MovFrameReg {
                offset: 16,
                source: Reg::Rdi,
            }]),
            vec![0x48, 0x89, 0xBD, 0xF0, 0xFF, 0xFF, 0xFF]
        );

        // mov [rbp - 8], r8 needs REX.R for the extended source
        assert_eq!(
            encode_instructions(vec![Instruction::MovFrameReg {
                offset: 8,
                source: Reg::R8,
            }]),
            vec![0x4C, 0x89, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn encodes_arithmetic() {
        assert_eq!(
            encode_instructions(vec![
                Instruction::AddRegReg {
                    destination: Reg::Rax,
                    source: Reg::Rcx,
                },
                Instruction::SubRegReg {
                    destination: Reg::Rax,
                    source: Reg::Rcx,
                },
                Instruction::ImulRegReg {
                    destination: Reg::Rax,
                    source: Reg::Rcx,
                },
            ]),
            vec![
                0x48, 0x01, 0xC8, // add rax, rcx
                0x48, 0x29, 0xC8, // sub rax, rcx
                0x48, 0x0F, 0xAF, 0xC1, // imul rax, rcx
            ]
        );
    }

    #[test]
    fn encodes_division_sequence() {
        assert_eq!(
            encode_instructions(vec![Instruction::Cqo, Instruction::IdivReg(Reg::Rcx)]),
            vec![0x48, 0x99, 0x48, 0xF7, 0xF9]
        );
    }

    #[test]
    fn encodes_comparison_sequence() {
        assert_eq!(
            encode_instructions(vec![
                Instruction::CmpRegReg {
                    lhs: Reg::Rax,
                    rhs: Reg::Rcx,
                },
                Instruction::SetCondition {
                    condition: Condition::LessThan,
                    destination: Reg::Rax,
                },
                Instruction::MovzxRegReg8 {
                    destination: Reg::Rax,
                    source: Reg::Rax,
                },
            ]),
            vec![
                0x48, 0x39, 0xC8, // cmp rax, rcx
                0x0F, 0x9C, 0xC0, // setl al
                0x48, 0x0F, 0xB6, 0xC0, // movzx rax, al
            ]
        );
    }

    #[test]
    fn encodes_sub_rsp_imm() {
        assert_eq!(
            encode_instructions(vec![Instruction::SubRegImm {
                destination: Reg::Rsp,
                value: 32,
            }]),
            vec![0x48, 0x81, 0xEC, 32, 0, 0, 0]
        );
    }

    #[test]
    fn resolves_forward_jump_displacement() {
        let target = LabelId::new(0);
        let text = TextSection {
            items: vec![
                Item::Instruction(Instruction::Jmp(target)),
                Item::Instruction(Instruction::Ret),
                Item::Label(target),
                Item::Instruction(Instruction::Ret),
            ],
        };

        // The jump skips exactly one ret byte: disp = 6 - 5 = 1
        assert_eq!(
            encode(&text, 1),
            vec![0xE9, 0x01, 0x00, 0x00, 0x00, 0xC3, 0xC3]
        );
    }

    #[test]
    fn resolves_backward_jump_displacement() {
        let target = LabelId::new(0);
        let text = TextSection {
            items: vec![
                Item::Label(target),
                Item::Instruction(Instruction::Ret),
                Item::Instruction(Instruction::Jmp(target)),
            ],
        };

        // Back over the ret and the jump itself: disp = 0 - 6 = -6
        assert_eq!(
            encode(&text, 1),
            vec![0xC3, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn resolves_conditional_jump() {
        let target = LabelId::new(0);
        let text = TextSection {
            items: vec![
                Item::Instruction(Instruction::JmpIf {
                    condition: Condition::Equal,
                    target,
                }),
                Item::Label(target),
            ],
        };

        assert_eq!(encode(&text, 1), vec![0x0F, 0x84, 0, 0, 0, 0]);
    }

    #[test]
    fn resolves_call_to_later_function() {
        let a = Symbol::new("caller_fn");
        let b = Symbol::new("callee_fn");
        let text = TextSection {
            items: vec![
                Item::FunctionLabel(a),
                Item::Instruction(Instruction::Call(b)),
                Item::Instruction(Instruction::Ret),
                Item::FunctionLabel(b),
                Item::Instruction(Instruction::Ret),
            ],
        };

        // callee_fn starts at byte 6; call ends at byte 5
        assert_eq!(
            encode(&text, 0),
            vec![0xE8, 0x01, 0x00, 0x00, 0x00, 0xC3, 0xC3]
        );
    }

    #[test]
    #[should_panic(expected = "jump to undefined label")]
    fn undefined_label_is_a_contract_violation() {
        let text = TextSection {
            items: vec![Item::Instruction(Instruction::Jmp(LabelId::new(0)))],
        };

        encode(&text, 1);
    }

    #[test]
    #[should_panic(expected = "call to undefined symbol")]
    fn undefined_symbol_is_a_contract_violation() {
        let text = TextSection {
            items: vec![Item::Instruction(Instruction::Call(Symbol::new(
                "nowhere",
            )))],
        };

        encode(&text, 0);
    }

    #[test]
    fn encoding_is_deterministic() {
        let build = || TextSection {
            items: vec![
                Item::FunctionLabel(Symbol::new("determinism_fn")),
                Item::Instruction(Instruction::Push(Reg::Rbp)),
                Item::Instruction(Instruction::MovRegImm {
                    destination: Reg::Rax,
                    value: 42,
                }),
                Item::Instruction(Instruction::Pop(Reg::Rbp)),
                Item::Instruction(Instruction::Ret),
            ],
        };

        assert_eq!(encode(&build(), 0), encode(&build(), 0));
    }
}
