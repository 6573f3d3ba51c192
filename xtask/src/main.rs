use std::path::{Path, PathBuf};
use std::process::Command;
use std::fs;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BPF_TARGET: &str = "bpfel-unknown-none";
const BPF_OBJECT_NAME: &str = "hivepf.bpf.o";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package hivepf")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build only the eBPF object (requires a nightly toolchain and bpf-linker)
    BuildEbpf {
        #[arg(long)]
        release: bool,
    },

    /// Build the eBPF object and the user-space binary
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple for the user-space binary
        #[arg(long)]
        target: Option<String>,
    },

    /// Copy binary and eBPF object to a remote host
    Deploy {
        /// Remote host (e.g., user@host or just host)
        #[arg(long)]
        host: String,

        #[arg(long, default_value = "/usr/local/bin/hivepf")]
        path: String,

        #[arg(long)]
        target: Option<String>,
    },

    /// Package binary, eBPF object and systemd unit into a tarball
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::BuildEbpf { release } => {
            build_ebpf(release)?;
        }
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Deploy { host, path, target } => {
            deploy(&host, &path, target.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn profile(release: bool) -> &'static str {
    if release { "release" } else { "debug" }
}

fn run(mut cmd: Command, what: &str) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {}", what))?;
    if !status.success() {
        bail!("{} failed", what);
    }
    Ok(())
}

/// Builds the kernel programs and returns the path of the object file.
fn build_ebpf(release: bool) -> Result<PathBuf> {
    let root = project_root()?;
    if which::which("bpf-linker").is_err() {
        bail!("bpf-linker not found. Install with: cargo install bpf-linker");
    }

    println!("Building eBPF programs...");
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root)
        .args(["+nightly", "build", "-p", "hivepf-ebpf"])
        .args(["--target", BPF_TARGET])
        .args(["-Z", "build-std=core"]);
    if release {
        cmd.arg("--release");
    }
    run(cmd, "eBPF build")?;

    let built = root
        .join("target")
        .join(BPF_TARGET)
        .join(profile(release))
        .join("hivepf");
    let object = root.join("target").join(BPF_OBJECT_NAME);
    fs::copy(&built, &object)
        .with_context(|| format!("Failed to copy {}", built.display()))?;
    println!("eBPF object: {}", object.display());
    Ok(object)
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let mut dir = root.join("target");
    if let Some(t) = target {
        dir = dir.join(t);
    }
    dir.join(profile(release)).join("hivepf")
}

fn build(release: bool, target: Option<&str>) -> Result<(PathBuf, PathBuf)> {
    let object = build_ebpf(release)?;
    let root = project_root()?;

    println!("Building hivepf...");
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).args(["build", "-p", "hivepf"]);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
    }
    run(cmd, "cargo build")?;

    let binary = binary_path(&root, release, target);
    println!("Build complete: {}", binary.display());
    Ok((binary, object))
}

fn deploy(host: &str, remote_path: &str, target: Option<&str>) -> Result<()> {
    let (binary, object) = build(true, target)?;

    println!("Deploying to {}:{}", host, remote_path);
    let mut scp = Command::new("scp");
    scp.arg(&binary)
        .arg(&object)
        .arg(format!("{}:/tmp/", host));
    run(scp, "scp")?;

    let install = format!(
        "sudo install -m 755 /tmp/hivepf {path} && \
         sudo install -D -m 644 /tmp/{obj} /usr/lib/hivepf/{obj}",
        path = remote_path,
        obj = BPF_OBJECT_NAME
    );
    let mut ssh = Command::new("ssh");
    ssh.arg(host).arg(&install);
    run(ssh, "remote install")?;

    println!("Deployed to {}:{}", host, remote_path);
    Ok(())
}

fn systemd_unit(env_file: &str) -> String {
    format!(
        r#"[Unit]
Description=hivepf kernel event telemetry
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/hivepf
EnvironmentFile=-{}
Restart=on-failure
RestartSec=5
CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON

[Install]
WantedBy=multi-user.target
"#,
        env_file
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let (binary, object) = build(true, target)?;
    let root = project_root()?;
    let output_path = root.join(output_dir);

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let package_name = format!("hivepf-{}-{}", env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create package directory")?;

    fs::copy(&binary, package_dir.join("hivepf"))?;
    fs::copy(&object, package_dir.join(BPF_OBJECT_NAME))?;
    fs::write(
        package_dir.join("hivepf.service"),
        systemd_unit("/etc/hivepf/hivepf.env"),
    )?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let mut tar = Command::new("tar");
    tar.current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name);
    run(tar, "tar")?;

    fs::remove_dir_all(&package_dir)?;
    println!("Package created: {}", tarball.display());
    Ok(())
}
