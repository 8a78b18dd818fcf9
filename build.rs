// Build script for borealis-kernel

fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();

    // x86_64 bare-metal target: link with the kernel layout script
    if target == "x86_64-unknown-none" {
        println!(
            "cargo:rustc-link-arg=-T{}/kernel/arch/x86_64/kernel.ld",
            manifest_dir
        );
        println!("cargo:rerun-if-changed=kernel/arch/x86_64/kernel.ld");
    }
}
