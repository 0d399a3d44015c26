use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the workspace.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build, then grant the binary CAP_NET_RAW so it can run without sudo.
    Setcap {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run with sudo.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the binary.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::Build { release } => build(release),
        Cli::Setcap { release } => {
            build(release)?;
            setcap(release)
        }
        Cli::Run { release, args } => {
            build(release)?;
            run(release, &args)
        }
    }
}

fn binary_path(release: bool) -> String {
    let profile = if release { "release" } else { "debug" };
    format!("target/{profile}/slowping")
}

fn build(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--workspace"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for workspace")?;
    anyhow::ensure!(status.success(), "workspace build failed");
    Ok(())
}

fn setcap(release: bool) -> anyhow::Result<()> {
    let bin = binary_path(release);
    let status = Command::new("sudo")
        .args(["setcap", "cap_net_raw+ep", &bin])
        .status()
        .context("failed to run setcap")?;
    anyhow::ensure!(status.success(), "setcap on {bin} failed");
    println!("{bin} can now open raw sockets without sudo");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = binary_path(release);

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.args(extra_args);
    let status = cmd.status().context("failed to run slowping")?;
    anyhow::ensure!(status.success(), "slowping exited with error");
    Ok(())
}
