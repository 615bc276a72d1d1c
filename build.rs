use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

fn gen_linker_script(linker_script_path: &PathBuf) {
    let linker_script_content = format!(
        r#"
        ENTRY(syscall_entry)
        MEMORY
        {{
            page0 (rwx) : ORIGIN = {base:#x}, LENGTH = 4K
        }}

        SECTIONS {{
            /* SYSCALL_HANDLER_ADDR / LSTAR must land on the very first byte. */
            .text.entry {base:#x} : {{
                *(.text.entry)
            }} > page0

            .text : {{
                *(.text .text.*)
            }} > page0

            .rodata : {{
                *(.rodata .rodata.*)
            }} > page0

            .data : {{
                *(.data .data.*)
            }} > page0

            .bss : {{
                *(.bss .bss.*)
                *(COMMON)
            }} > page0

            /DISCARD/ : {{
                *(.eh_frame) *(.eh_frame_hdr) *(.comment) *(.note*)
            }}
        }}
        "#,
        base = fault_abi::SYSCALL_HANDLER_ADDR,
    );

    let mut f = File::create(linker_script_path).unwrap();
    f.write_all(linker_script_content.as_bytes()).unwrap();
}

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let guest_kernel_dir = env::current_dir().unwrap().join("guest-kernel");
    let linker_script_path = out_dir.join("linker.ld");

    gen_linker_script(&linker_script_path);

    let rustflags = format!(
        "-C link-arg=-T{} -C relocation-model=static -C code-model=kernel",
        linker_script_path.display()
    );

    let status = Command::new("cargo")
        .env("RUSTFLAGS", rustflags)
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .env_remove("CARGO_ENCODED_RUSTFLAGS")
        .args([
            "build",
            "--release",
            "--target",
            "x86_64-unknown-none",
            "--target-dir",
            out_dir.join("guest-kernel-target").to_str().unwrap(),
        ])
        .current_dir(&guest_kernel_dir)
        .status()
        .expect("failed to run cargo build for guest-kernel");

    if !status.success() {
        panic!("compiling guest-kernel crate failed");
    }

    let elf_path = out_dir.join("guest-kernel-target/x86_64-unknown-none/release/guest-kernel");

    println!("cargo:rustc-env=GUEST_KERNEL_BIN={}", elf_path.display());
    println!("cargo:rerun-if-changed=guest-kernel");
    println!("cargo:rerun-if-changed=fault-abi");
}
