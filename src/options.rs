//! Command-line surface, built with `clap::Parser` derive.

use clap::Parser;

/// The compiled-in default socket name: abstract namespace, so stale
/// instances can't collide on the filesystem and nothing needs cleaning up
/// if the daemon is killed without notice.
pub const DEFAULT_SOCKET: &str = "@/vme/vmeirqd";

/// Multiplex VME crate interrupts to local clients over a sequenced-packet
/// socket.
#[derive(Parser, Debug)]
#[command(name = "vmeirqd", version, about)]
pub struct Opt {
    /// Provide additional debug-level logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Increase logging verbosity. Repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Allow clients to request fake (client-injected) interrupts.
    #[arg(short, long = "fake-ok")]
    pub fake_ok: bool,

    /// Skip VME crate enumeration. Implies --fake-ok.
    #[arg(short = 'n', long = "no-vme")]
    pub no_vme: bool,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'k', long)]
    pub foreground: bool,

    /// Override the socket name to bind/connect to.
    #[arg(long, default_value = "@/vme/vmeirqd")]
    pub socket: String,

    /// Milliseconds to wait for a client's ACK/NAK to a delivered interrupt
    /// before treating the exchange as a NAK.
    #[arg(long, default_value_t = 2000)]
    pub delivery_timeout_ms: u64,

    /// Write the daemon's pid to this file after daemonizing, and remove it
    /// on clean exit.
    #[arg(long)]
    pub pid_file: Option<std::path::PathBuf>,
}

impl Opt {
    /// `--no-vme` implies `--fake-ok`: without real hardware, fake injection
    /// is the only way to exercise delivery at all.
    pub fn effective_fake_ok(&self) -> bool {
        self.fake_ok || self.no_vme
    }
}
