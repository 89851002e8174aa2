//! CLI argument definitions.

use std::path::PathBuf;

use crate::logging::LogSink;

#[derive(clap::Parser)]
#[clap(author, version, about = "A user space SIIT/NAT64 packet translator", long_about = None)]
pub struct Args {
    /// Read configuration options from this file
    #[clap(short = 'c', long = "config", default_value = "/etc/siitd.conf")]
    pub config_file: PathBuf,

    /// Create the persistent TUN interface, then exit
    #[clap(long, conflicts_with = "rmtun")]
    pub mktun: bool,

    /// Remove the persistent TUN interface, then exit
    #[clap(long)]
    pub rmtun: bool,

    /// Set uid to this user after initialization
    #[clap(short, long)]
    pub user: Option<String>,

    /// Set gid to this group after initialization
    #[clap(short, long)]
    pub group: Option<String>,

    /// chroot() to data-dir before translating
    #[clap(short = 'r', long)]
    pub chroot: bool,

    /// Write the process ID of the daemon to this file
    #[clap(short, long)]
    pub pidfile: Option<PathBuf>,

    /// Do not fork into the background
    #[clap(short, long)]
    pub nodetach: bool,

    /// Enable debug messages (implies --nodetach and --stdout)
    #[clap(short, long)]
    pub debug: bool,

    #[clap(flatten)]
    sink: SinkArgs,
}

#[derive(clap::Args)]
#[group(multiple = false)]
struct SinkArgs {
    /// Log messages to syslog (default)
    #[clap(long)]
    syslog: bool,

    /// Log messages to stdout
    #[clap(long)]
    stdout: bool,

    /// Log messages to the systemd journal
    #[clap(long)]
    journal: bool,
}

impl Args {
    /// The effective log sink; `--debug` overrides everything else.
    pub fn log_sink(&self) -> LogSink {
        if self.debug || self.sink.stdout {
            LogSink::Stdout
        } else if self.sink.journal {
            LogSink::Journal
        } else {
            LogSink::Syslog
        }
    }

    /// Whether to stay in the foreground.
    pub fn foreground(&self) -> bool {
        self.nodetach || self.debug
    }
}
