use colored::Colorize;
use itertools::Itertools;

use crate::{
    index::Index,
    middle::ir::{
        BinaryOp, CompareOp, IrFunction, IrInstruction, IrProgram, LabelId, Operand, TempId,
    },
};

/// Renders the IR program as a tree of debug lines.
///
/// The sequence is lazy and has no side effects; callers decide whether the
/// lines ever reach a terminal.
pub fn debug_lines(program: &IrProgram) -> impl Iterator<Item = String> + '_ {
    let global_count = program.globals.len();
    let globals_header =
        (global_count > 0).then(|| format!("├── {}", "Global Variables:".bold()));
    let globals = program.globals.iter().enumerate().map(move |(i, global)| {
        let prefix = if i + 1 == global_count { "└── " } else { "├── " };
        let rendered = match global.initial_value {
            Some(value) => format!(
                "{} : {} = {}",
                global.name,
                global.ty.name.magenta(),
                value.to_string().purple()
            ),
            None => format!("{} : {}", global.name, global.ty.name.magenta()),
        };

        format!("│   {prefix}{rendered}")
    });

    let function_count = program.functions.len();
    let functions_header = std::iter::once(format!("├── {}", "Functions:".bold()));
    let functions = program
        .functions
        .iter()
        .enumerate()
        .flat_map(move |(i, function)| function_lines(function, i + 1 == function_count));

    globals_header
        .into_iter()
        .chain(globals)
        .chain(functions_header)
        .chain(functions)
}

fn function_lines(function: &IrFunction, is_last: bool) -> impl Iterator<Item = String> + '_ {
    let function_prefix = if is_last { "└── " } else { "├── " };
    let header = std::iter::once(format!(
        "│   {function_prefix}{}() : {}",
        function.name.to_string().blue(),
        function.return_type.name.magenta()
    ));

    let parameter_count = function.parameters.len();
    let parameters_header =
        (parameter_count > 0).then(|| "│   │   ├── Parameters:".to_string());
    let parameters = function
        .parameters
        .iter()
        .enumerate()
        .map(move |(i, parameter)| {
            let prefix = if i + 1 == parameter_count { "└── " } else { "├── " };
            format!(
                "│   │   │   {prefix}{} : {}",
                parameter.name,
                parameter.ty.name.magenta()
            )
        });

    let local_count = function.locals.len();
    let locals_header = (local_count > 0).then(|| "│   │   ├── Local Variables:".to_string());
    let locals = function.locals.values().enumerate().map(move |(i, local)| {
        let prefix = if i + 1 == local_count { "└── " } else { "├── " };
        format!(
            "│   │   │   {prefix}{} : {}",
            local.name,
            local.ty.name.magenta()
        )
    });

    let instruction_count = function.instructions.len();
    let instructions_header =
        (instruction_count > 0).then(|| "│   │   └── Instructions:".to_string());
    let instructions = function
        .instructions
        .iter()
        .enumerate()
        .map(move |(i, instruction)| {
            let prefix = if i + 1 == instruction_count { "└── " } else { "├── " };
            format!("│   │   │   {prefix}{instruction}")
        });

    header
        .chain(parameters_header.into_iter())
        .chain(parameters)
        .chain(locals_header.into_iter())
        .chain(locals)
        .chain(instructions_header.into_iter())
        .chain(instructions)
}

impl core::fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrInstruction::LoadConst { destination, value } => write!(
                f,
                "{destination} {} {} {}",
                "=".white(),
                "const".cyan(),
                value.to_string().purple()
            ),
            IrInstruction::LoadVar {
                destination,
                variable,
            } => write!(f, "{destination} {} {} {variable}", "=".white(), "load".cyan()),
            IrInstruction::StoreVar { variable, source } => {
                write!(f, "{} {variable} {} {source}", "store".cyan(), "<-".white())
            }
            IrInstruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => write!(
                f,
                "{destination} {} {lhs} {} {rhs}",
                "=".white(),
                operator.to_string().white()
            ),
            IrInstruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => write!(
                f,
                "{destination} {} {lhs} {} {rhs}",
                "=".white(),
                operator.to_string().white()
            ),
            IrInstruction::Jump { target } => {
                write!(f, "{} {}", "jmp".cyan(), target.to_string().blue())
            }
            IrInstruction::JumpIfZero { condition, target } => {
                write!(
                    f,
                    "{} {condition} {}",
                    "jz".cyan(),
                    target.to_string().blue()
                )
            }
            IrInstruction::Label(label) => write!(f, "{}:", label.to_string().bright_red()),
            IrInstruction::Call {
                destination,
                callee,
                arguments,
            } => {
                if let Some(destination) = destination {
                    write!(f, "{destination} {} ", "=".white())?;
                }

                write!(
                    f,
                    "{} {callee}({})",
                    "call".cyan(),
                    arguments.iter().map(|a| a.to_string()).join(", ")
                )
            }
            IrInstruction::Return { value: Some(value) } => {
                write!(f, "{} {value}", "ret".cyan())
            }
            IrInstruction::Return { value: _ } => write!(f, "{}", "ret".cyan()),
        }
    }
}

impl core::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%{}", self.index()).yellow())
    }
}

impl core::fmt::Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".L{}", self.index())
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Const(value) => write!(f, "{}", value.to_string().purple()),
            Operand::Temp(temp) => write!(f, "{temp}"),
        }
    }
}

impl core::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulus => "%",
        })
    }
}

impl core::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::LessThan => "<",
            CompareOp::LessThanOrEqual => "<=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterThanOrEqual => ">=",
        })
    }
}
