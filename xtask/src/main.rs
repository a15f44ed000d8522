use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "kmlprobe";
const EXAMPLE_CONFIG: &str = "kmlprobe.example.yaml";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, run and package kmlprobe")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the loader with the eBPF object embedded
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the loader as root, forwarding the remaining arguments
    Run {
        #[arg(long)]
        release: bool,

        /// Settings file passed as --config
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Build a release tarball with the binary and the example settings
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Run {
            release,
            config,
            args,
        } => run(release, config.as_deref(), &args)?,
        Commands::Package { target, output } => package(target.as_deref(), &output)?,
    }
    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join(BINARY)
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    // The eBPF object itself always needs a Linux host toolchain; only the
    // loader is cross-compiled.
    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let program = if cross {
        which::which("cross").context(
            "Cross-compiling to Linux requires the 'cross' tool (cargo install cross) and Docker",
        )?;
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(program);
    cmd.current_dir(&root).args(["build", "-p", BINARY]);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.args(["--target", t]);
    }

    println!("Building {} ({})", BINARY, target.unwrap_or("host"));
    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    println!("Built {}", binary.display());
    Ok(binary)
}

fn run(release: bool, config: Option<&Path>, args: &[String]) -> Result<()> {
    let binary = build(release, None)?;

    let mut cmd = Command::new("sudo");
    cmd.arg("-E").arg(&binary);
    if let Some(config) = config {
        cmd.arg("--config").arg(config);
    }
    cmd.args(args);

    let status = cmd.status().context("Failed to run kmlprobe")?;
    if !status.success() {
        bail!("kmlprobe exited with {}", status);
    }
    Ok(())
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    let root = project_root()?;

    let output_path = root.join(output_dir);
    let arch = target.unwrap_or(std::env::consts::ARCH);
    let package_name = format!("{}-{}-{}", BINARY, env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create package directory")?;

    fs::copy(&binary, package_dir.join(BINARY))?;
    let example = root.join(EXAMPLE_CONFIG);
    if example.exists() {
        fs::copy(&example, package_dir.join(EXAMPLE_CONFIG))?;
    }

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;
    println!("Package created: {}", tarball.display());
    Ok(())
}
