use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();

    // Bare-metal AArch64 builds link with the kernel's layout script; host
    // builds (tests) use the platform defaults.
    if target.starts_with("aarch64") && target.contains("-none") {
        let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
        println!(
            "cargo:rustc-link-arg=-T{}/src/arch/aarch64/link.ld",
            manifest_dir
        );
        println!("cargo:rerun-if-changed=src/arch/aarch64/link.ld");
    }
}
