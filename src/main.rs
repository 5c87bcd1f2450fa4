use std::path::PathBuf;

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use indoc::indoc;
use minicc::{
    backend::{CodeGenerator, Target, elf},
    middle::pretty_print,
};

#[derive(Debug, ClapParser)]
#[command(version, about = "Small C Compiler producing x86-64 Linux ELF executables")]
#[command(long_about = indoc! {"
    Compiles a single C source file straight to a runnable x86-64 Linux
    executable. No assembler or linker is invoked; the machine code and the
    ELF image are produced in-process.

    The supported language subset covers signed integer types, arithmetic,
    comparisons, local and global variables, if/else, while, and functions
    with up to six value parameters.
"})]
pub struct Args {
    /// C source file to compile
    source_file: PathBuf,

    /// Path of the executable to produce
    output_file: PathBuf,

    /// Print the IR tree before generating code
    #[arg(long)]
    dump_ir: bool,
}

fn main() {
    let args = Args::parse();

    if !args.source_file.exists() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!(
                    "Source file '{}' does not exist!",
                    args.source_file.display()
                ),
            )
            .exit()
    }

    if !args.source_file.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!(
                    "Input path '{}' is not a file!",
                    args.source_file.display()
                ),
            )
            .exit()
    }

    let source_file = match minicc::read_source(&args.source_file) {
        Ok(source_file) => source_file,
        Err(error) => {
            eprintln!("error: could not read '{}': {error}", args.source_file.display());
            std::process::exit(1);
        }
    };

    let program = minicc::compile_to_ir(&source_file);

    if args.dump_ir {
        for line in pretty_print::debug_lines(&program) {
            println!("{line}");
        }
    }

    let assembly = Target::x86_64Linux.code_generator().generate(&program);

    if let Err(error) = elf::write_executable(&assembly, &args.output_file) {
        eprintln!(
            "error: could not write '{}': {error}",
            args.output_file.display()
        );
        std::process::exit(1);
    }
}
