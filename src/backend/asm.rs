use itertools::Itertools;

use crate::{frontend::intern::Symbol, middle::ir::LabelId};

/// The complete lowered program: one instruction stream for all functions
/// (the entry stub first, then each function in definition order) and the
/// optional initialized-data section.
#[derive(Debug)]
pub struct AssemblyProgram {
    pub text: TextSection,
    pub data: Option<DataSection>,
    /// Total number of labels referenced by the text section
    pub label_count: usize,
}

#[derive(Debug, Default)]
pub struct TextSection {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A global symbol marking the start of a function's code
    FunctionLabel(Symbol),
    /// A local jump target
    Label(LabelId),
    Instruction(Instruction),
}

#[derive(Debug, Default)]
pub struct DataSection {
    pub entries: Vec<DataEntry>,
}

/// A named, sized, initialized blob in the data section
#[derive(Debug)]
pub struct DataEntry {
    pub name: Symbol,
    pub bytes: Vec<u8>,
}

impl DataSection {
    /// Concatenation of all entries, in declaration order
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|entry| entry.bytes.iter().copied())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.bytes.is_empty())
    }
}

/// General purpose 64-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// The 3-bit register number used in ModR/M and opcode encodings
    pub fn encoding(self) -> u8 {
        match self {
            Self::Rax => 0,
            Self::Rcx => 1,
            Self::Rdx => 2,
            Self::Rbx => 3,
            Self::Rsp => 4,
            Self::Rbp => 5,
            Self::Rsi => 6,
            Self::Rdi => 7,
            Self::R8 => 0,
            Self::R9 => 1,
            Self::R10 => 2,
            Self::R11 => 3,
            Self::R12 => 4,
            Self::R13 => 5,
            Self::R14 => 6,
            Self::R15 => 7,
        }
    }

    /// Whether the register number needs a REX extension bit (r8-r15)
    pub fn needs_rex_ext(self) -> bool {
        matches!(
            self,
            Self::R8
                | Self::R9
                | Self::R10
                | Self::R11
                | Self::R12
                | Self::R13
                | Self::R14
                | Self::R15
        )
    }

    /// Name of the low byte of this register, for rendering 8-bit forms
    pub fn low8_name(self) -> &'static str {
        match self {
            Self::Rax => "al",
            Self::Rcx => "cl",
            Self::Rdx => "dl",
            Self::Rbx => "bl",
            Self::Rsp => "spl",
            Self::Rbp => "bpl",
            Self::Rsi => "sil",
            Self::Rdi => "dil",
            Self::R8 => "r8b",
            Self::R9 => "r9b",
            Self::R10 => "r10b",
            Self::R11 => "r11b",
            Self::R12 => "r12b",
            Self::R13 => "r13b",
            Self::R14 => "r14b",
            Self::R15 => "r15b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Condition {
    /// The condition nibble shared by the `jcc` (0F 80+cc) and `setcc`
    /// (0F 90+cc) opcode families
    pub fn code(self) -> u8 {
        match self {
            Self::Equal => 0x4,
            Self::NotEqual => 0x5,
            Self::LessThan => 0xC,
            Self::GreaterThanOrEqual => 0xD,
            Self::LessThanOrEqual => 0xE,
            Self::GreaterThan => 0xF,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Equal => "e",
            Self::NotEqual => "ne",
            Self::LessThan => "l",
            Self::LessThanOrEqual => "le",
            Self::GreaterThan => "g",
            Self::GreaterThanOrEqual => "ge",
        }
    }
}

/// The symbolic instruction forms the code generator emits. Frame operands
/// are byte offsets below the frame pointer; all arithmetic is 64-bit.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Push(Reg),
    Pop(Reg),
    MovRegReg { destination: Reg, source: Reg },
    MovRegImm { destination: Reg, value: i64 },
    /// mov destination, [rbp - offset]
    MovRegFrame { destination: Reg, offset: i32 },
    /// mov [rbp - offset], source
    MovFrameReg { offset: i32, source: Reg },
    AddRegReg { destination: Reg, source: Reg },
    SubRegReg { destination: Reg, source: Reg },
    ImulRegReg { destination: Reg, source: Reg },
    SubRegImm { destination: Reg, value: i32 },
    /// Sign-extend rax into rdx:rax ahead of a division
    Cqo,
    IdivReg(Reg),
    CmpRegReg { lhs: Reg, rhs: Reg },
    TestRegReg { lhs: Reg, rhs: Reg },
    /// Sets the low byte of the destination from the condition flags
    SetCondition { condition: Condition, destination: Reg },
    /// Zero-extends the low byte of the source into the 64-bit destination
    MovzxRegReg8 { destination: Reg, source: Reg },
    Jmp(LabelId),
    JmpIf { condition: Condition, target: LabelId },
    Call(Symbol),
    Ret,
    Syscall,
}

impl core::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Item::FunctionLabel(name) => write!(f, "{name}:"),
            Item::Label(label) => write!(f, "{label}:"),
            Item::Instruction(instruction) => write!(f, "    {instruction}"),
        }
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Push(reg) => write!(f, "push {reg}"),
            Instruction::Pop(reg) => write!(f, "pop {reg}"),
            Instruction::MovRegReg {
                destination,
                source,
            } => write!(f, "mov {destination}, {source}"),
            Instruction::MovRegImm { destination, value } => {
                write!(f, "mov {destination}, {value}")
            }
            Instruction::MovRegFrame {
                destination,
                offset,
            } => write!(f, "mov {destination}, [rbp - {offset}]"),
            Instruction::MovFrameReg { offset, source } => {
                write!(f, "mov [rbp - {offset}], {source}")
            }
            Instruction::AddRegReg {
                destination,
                source,
            } => write!(f, "add {destination}, {source}"),
            Instruction::SubRegReg {
                destination,
                source,
            } => write!(f, "sub {destination}, {source}"),
            Instruction::ImulRegReg {
                destination,
                source,
            } => write!(f, "imul {destination}, {source}"),
            Instruction::SubRegImm { destination, value } => {
                write!(f, "sub {destination}, {value}")
            }
            Instruction::Cqo => write!(f, "cqo"),
            Instruction::IdivReg(reg) => write!(f, "idiv {reg}"),
            Instruction::CmpRegReg { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Instruction::TestRegReg { lhs, rhs } => write!(f, "test {lhs}, {rhs}"),
            Instruction::SetCondition {
                condition,
                destination,
            } => write!(f, "set{} {}", condition.suffix(), destination.low8_name()),
            Instruction::MovzxRegReg8 {
                destination,
                source,
            } => write!(f, "movzx {destination}, {}", source.low8_name()),
            Instruction::Jmp(target) => write!(f, "jmp {target}"),
            Instruction::JmpIf { condition, target } => {
                write!(f, "j{} {target}", condition.suffix())
            }
            Instruction::Call(name) => write!(f, "call {name}"),
            Instruction::Ret => write!(f, "ret"),
            Instruction::Syscall => write!(f, "syscall"),
        }
    }
}

impl TextSection {
    /// Renders the text section as assembly listing lines, for diagnostics
    /// and tests
    pub fn render(&self) -> String {
        self.items.iter().map(|item| item.to_string()).join("\n")
    }
}
