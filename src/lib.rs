//! A compiler for a small subset of C that emits standalone x86-64 Linux
//! ELF executables, with no external assembler or linker involved.
//!
//! The pipeline is strictly sequential: source text is parsed into an AST,
//! lowered into a flattened IR, translated into an x86-64 instruction
//! stream, encoded into machine code, and serialized as an ELF image.

use std::{io, path::Path};

use crate::{
    backend::{CodeGenerator, Target, asm::AssemblyProgram, elf},
    frontend::{SourceFile, SourceFileOrigin, parser::Parser},
    middle::{ast_lowering::IrGenerator, ir::IrProgram},
};

pub mod backend;
pub mod frontend;
pub mod index;
pub mod middle;

/// Compiles one translation unit to an executable at `output`.
///
/// Source-level problems are reported to stderr and terminate the process;
/// I/O failures while reading the input or writing the executable are
/// returned to the caller.
pub fn compile(input: &Path, output: &Path) -> io::Result<()> {
    let source_file = read_source(input)?;
    let program = compile_to_ir(&source_file);
    let assembly = Target::x86_64Linux.code_generator().generate(&program);

    elf::write_executable(&assembly, output)
}

pub fn read_source(input: &Path) -> io::Result<SourceFile> {
    Ok(SourceFile {
        contents: std::fs::read_to_string(input)?,
        origin: SourceFileOrigin::File(input.to_path_buf()),
    })
}

/// Front half of the pipeline: source text to IR
pub fn compile_to_ir(source_file: &SourceFile) -> IrProgram {
    let module = Parser::parse_module(source_file);

    IrGenerator::generate(&module)
}

/// Back half of the pipeline: IR to the final image bytes
pub fn compile_to_image(program: &IrProgram) -> Vec<u8> {
    let assembly: AssemblyProgram = Target::x86_64Linux.code_generator().generate(program);

    elf::build_image(&assembly)
}
