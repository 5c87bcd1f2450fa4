//! End-to-end pipeline tests: C source in, ELF image (and on x86-64 Linux
//! hosts, process exit status) out.

use indoc::indoc;
use minicc::frontend::{SourceFile, SourceFileOrigin};

fn source(contents: &str) -> SourceFile {
    SourceFile {
        contents: contents.to_owned(),
        origin: SourceFileOrigin::Memory,
    }
}

fn compile_image(contents: &str) -> Vec<u8> {
    let source = source(contents);
    let program = minicc::compile_to_ir(&source);

    minicc::compile_to_image(&program)
}

fn u16_at(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(image[offset..offset + 2].try_into().unwrap())
}

fn u64_at(image: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(image[offset..offset + 8].try_into().unwrap())
}

#[test]
fn produces_a_wellformed_elf_header() {
    let image = compile_image("int main() { return 42; }");

    assert_eq!(&image[0..4], b"\x7FELF");
    assert_eq!(image[4], 2); // 64-bit
    assert_eq!(image[5], 1); // little endian
    assert_eq!(u16_at(&image, 16), 2); // ET_EXEC
    assert_eq!(u16_at(&image, 18), 62); // EM_X86_64
}

#[test]
fn entry_point_matches_the_text_segment() {
    let image = compile_image("int main() { return 42; }");

    let entry = u64_at(&image, 24);
    let text_offset = u64_at(&image, 64 + 8);
    let text_vaddr = u64_at(&image, 64 + 16);

    assert_eq!(entry, text_vaddr);
    assert_eq!(entry % 0x1000, text_offset % 0x1000);
}

#[test]
fn every_declared_offset_slices_to_its_region() {
    let image = compile_image(indoc! {"
        int counter = 7;

        int main() { return 0; }
    "});

    // Text region is non-empty and starts with the entry stub's call
    let text_offset = u64_at(&image, 64 + 8) as usize;
    let text_size = u64_at(&image, 64 + 32) as usize;
    assert!(text_size > 0);
    assert_eq!(image[text_offset], 0xE8); // call main

    // Data region holds the initialized global
    let data_offset = u64_at(&image, 64 + 56 + 8) as usize;
    let data_size = u64_at(&image, 64 + 56 + 32) as usize;
    assert_eq!(data_size, 4);
    assert_eq!(&image[data_offset..data_offset + 4], &[7, 0, 0, 0]);

    // The four section headers close out the file at e_shoff
    let shoff = u64_at(&image, 40) as usize;
    assert_eq!(image.len(), shoff + 4 * 64);
}

#[test]
fn compiling_twice_is_byte_identical() {
    let program = indoc! {"
        int add(int a, int b)
        {
            return a + b;
        }

        int main()
        {
            int result = add(5, 7);
            return result;
        }
    "};

    assert_eq!(compile_image(program), compile_image(program));
}

#[test]
fn compile_writes_an_executable_file() {
    let input = mktemp::Temp::new_file().unwrap();
    let output = mktemp::Temp::new_file().unwrap();

    std::fs::write(
        &input,
        indoc! {"
            int main()
            {
                return 42;
            }
        "},
    )
    .unwrap();

    minicc::compile(input.as_ref(), output.as_ref()).unwrap();

    let metadata = std::fs::metadata(&output).unwrap();
    assert!(metadata.len() > 0);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_ne!(metadata.permissions().mode() & 0o111, 0);
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod execution {
    use super::*;

    /// Compiles the source and runs the produced binary, returning its exit
    /// status
    fn run(contents: &str) -> i32 {
        let output = mktemp::Temp::new_file().unwrap();

        let source = source(contents);
        let program = minicc::compile_to_ir(&source);
        let image = minicc::compile_to_image(&program);

        std::fs::write(&output, &image).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let binary: &std::path::Path = output.as_ref();

        std::process::Command::new(binary)
            .status()
            .expect("produced binary should be runnable")
            .code()
            .expect("produced binary should exit normally")
    }

    #[test]
    fn constant_return_becomes_the_exit_status() {
        let status = run(indoc! {"
            int main()
            {
                return 42;
            }
        "});

        assert_eq!(status, 42);
    }

    #[test]
    fn locals_are_stored_and_summed() {
        let status = run(indoc! {"
            int main()
            {
                int x = 10;
                int y = 20;
                int z = x + y;
                return z;
            }
        "});

        assert_eq!(status, 30);
    }

    #[test]
    fn function_call_passes_register_arguments() {
        let status = run(indoc! {"
            int add(int a, int b)
            {
                return a + b;
            }

            int main()
            {
                int result = add(5, 7);
                return result;
            }
        "});

        assert_eq!(status, 12);
    }

    #[test]
    fn forward_jump_lands_on_its_target() {
        let status = run(indoc! {"
            int main()
            {
                int x = 1;
                if (x == 0) {
                    return 7;
                }
                return 9;
            }
        "});

        assert_eq!(status, 9);
    }

    #[test]
    fn while_loop_iterates() {
        let status = run(indoc! {"
            int main()
            {
                int n = 10;
                int sum = 0;
                while (n > 0) {
                    sum = sum + n;
                    n = n - 1;
                }
                return sum;
            }
        "});

        assert_eq!(status, 55);
    }

    #[test]
    fn arithmetic_matches_c_semantics() {
        let status = run(indoc! {"
            int main()
            {
                int a = 7 * 6 - 2;      // 40
                int b = a / 3;          // 13
                int c = a % 3;          // 1
                return b * 2 + c + (0 - 2) * 5;  // 26 + 1 - 10
            }
        "});

        assert_eq!(status, 17);
    }

    #[test]
    fn nested_calls_preserve_frames() {
        let status = run(indoc! {"
            int square(int n)
            {
                return n * n;
            }

            int sum_of_squares(int a, int b)
            {
                return square(a) + square(b);
            }

            int main()
            {
                return sum_of_squares(3, 4);
            }
        "});

        assert_eq!(status, 25);
    }

    #[test]
    fn else_branch_is_taken_when_condition_is_zero() {
        let status = run(indoc! {"
            int main()
            {
                int x = 0;
                if (x) {
                    return 1;
                } else {
                    return 2;
                }
            }
        "});

        assert_eq!(status, 2);
    }
}
