use std::{env, path::PathBuf, process::Command};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed=../kmlprobe-ebpf/src");
    println!("cargo:rerun-if-changed=../kmlprobe-common/src");
    println!("cargo:rerun-if-env-changed=KMLPROBE_SKIP_EBPF_BUILD");

    // Host-only builds (unit tests, docs) can skip the nightly BPF toolchain.
    // The resulting binary refuses to load.
    if env::var_os("KMLPROBE_SKIP_EBPF_BUILD").is_some() {
        println!("cargo:warning=KMLPROBE_SKIP_EBPF_BUILD set, embedding an empty eBPF object");
        std::fs::write(out_dir.join("kmlprobe"), b"").expect("Failed to write placeholder object");
        return;
    }

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    };

    let ebpf_dir = PathBuf::from("../kmlprobe-ebpf");

    // Separate target directory so the nested cargo does not wait on our lock.
    let ebpf_target_dir = out_dir.join("ebpf-target");

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .expect("Failed to execute cargo command");

    if !status.success() {
        panic!("Failed to build eBPF program");
    }

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/kmlprobe", bpf_target));

    let out_file = out_dir.join("kmlprobe");
    std::fs::copy(&ebpf_binary, &out_file).expect("Failed to copy eBPF object file");
}
