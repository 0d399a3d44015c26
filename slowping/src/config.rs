use serde::Deserialize;
use std::fs;
use std::path::Path;

use slowping_common::ICMP_HEADER_LEN;

/// Smallest IPv4 header; a datagram buffer must at least fit this plus ICMP.
const MIN_IPV4_HEADER_LEN: usize = 20;

/// How per-source processing is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One task per source address, fed by a bounded queue.
    Worker,
    /// Everything on the receive path; one source's delay stalls all others.
    Inline,
}

/// What the receive path does when a source's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FullQueuePolicy {
    /// Wait for space. Stalls the receive path for every source.
    Block,
    /// Discard the datagram and log a warning.
    Drop,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Delay (ms) at or above which a source's delay resets to 1 ms.
    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,

    /// Pending datagrams allowed per source in worker mode.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_full_queue")]
    pub full_queue: FullQueuePolicy,

    #[serde(default = "default_mode")]
    pub mode: DispatchMode,

    /// Receive buffer size in bytes.
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,

    /// Socket read timeout (ms); also the shutdown polling interval.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_ceiling_ms() -> u64 {
    1_048_576
}

fn default_queue_depth() -> usize {
    100
}

fn default_full_queue() -> FullQueuePolicy {
    FullQueuePolicy::Block
}

fn default_mode() -> DispatchMode {
    DispatchMode::Worker
}

fn default_max_datagram() -> usize {
    65536
}

fn default_read_timeout_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ceiling_ms: default_ceiling_ms(),
            queue_depth: default_queue_depth(),
            full_queue: default_full_queue(),
            mode: default_mode(),
            max_datagram: default_max_datagram(),
            read_timeout_ms: default_read_timeout_ms(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ceiling) = cli.ceiling_ms {
            self.ceiling_ms = ceiling;
        }
        if let Some(depth) = cli.queue_depth {
            self.queue_depth = depth;
        }
        if let Some(policy) = cli.full_queue {
            self.full_queue = policy;
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.ceiling_ms > 0, "ceiling_ms must be at least 1");
        anyhow::ensure!(self.queue_depth > 0, "queue_depth must be at least 1");
        anyhow::ensure!(
            self.max_datagram >= MIN_IPV4_HEADER_LEN + ICMP_HEADER_LEN,
            "max_datagram must be at least {} bytes",
            MIN_IPV4_HEADER_LEN + ICMP_HEADER_LEN
        );
        anyhow::ensure!(self.read_timeout_ms > 0, "read_timeout_ms must be at least 1");
        Ok(())
    }
}

use clap::Parser;

/// slowping: ICMP echo responder that answers slower every time you ask
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Delay ceiling in milliseconds; reaching it resets the delay to 1 ms.
    #[arg(long)]
    pub ceiling_ms: Option<u64>,

    /// Pending datagrams allowed per source before the full-queue policy applies.
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Behaviour when a source's queue is full.
    #[arg(long, value_enum)]
    pub full_queue: Option<FullQueuePolicy>,

    /// Per-source worker tasks, or inline processing on the receive path.
    #[arg(long, value_enum)]
    pub mode: Option<DispatchMode>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}
