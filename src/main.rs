use std::time::Duration;

use clap::Parser;
use log::{error, info};

use vmeirqd::dispatcher::Dispatcher;
use vmeirqd::hardware::{CrateAdapter, DeviceFileAdapter, SimulatedAdapter};
use vmeirqd::lifecycle;
use vmeirqd::options::Opt;

fn run(opt: Opt) -> anyhow::Result<()> {
    lifecycle::configure_logging(&opt)?;

    let adapter: Box<dyn CrateAdapter> = if opt.no_vme {
        Box::new(SimulatedAdapter)
    } else {
        Box::new(DeviceFileAdapter::new())
    };

    let fake_ok = opt.effective_fake_ok();
    let delivery_timeout = Duration::from_millis(opt.delivery_timeout_ms);

    let mut dispatcher = Dispatcher::new(adapter, &opt.socket, fake_ok, delivery_timeout)?;

    lifecycle::set_realtime_priority();
    vmeirqd::signals::install()?;
    lifecycle::daemonize(opt.foreground)?;

    if let Some(pid_file) = &opt.pid_file {
        lifecycle::write_pid_file(pid_file)?;
    }

    info!(
        "starting vmeirqd {} {}",
        env!("CARGO_PKG_VERSION"),
        if fake_ok { "with --fake-ok" } else { "" }
    );

    let result = dispatcher.run();

    if let Some(pid_file) = &opt.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    result.map_err(|e| e.into())
}

fn main() {
    let opt = Opt::parse();
    if let Err(e) = run(opt) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
