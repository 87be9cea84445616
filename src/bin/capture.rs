#[cfg(unix)]
mod cli {
    use std::io::stdin;
    use std::os::fd::RawFd;
    use std::path::PathBuf;
    use std::thread::sleep;
    use std::time::Duration;

    use clap::Parser;
    use tracing::info;

    use tun_capture::config::DEFAULT_TRACE_NAME;
    use tun_capture::logging::init_logging;
    use tun_capture::{Capturer, FdTunnel};

    /// Capture the traffic of an already configured tunnel into a pcap file
    #[derive(Debug, Parser)]
    #[command(name = "capture", version)]
    struct Args {
        /// Open tunnel descriptor inherited from the process that created the interface
        #[arg(long)]
        fd: RawFd,

        /// Where to write the trace. The directory must exist.
        #[arg(short, long, default_value = DEFAULT_TRACE_NAME)]
        output: PathBuf,

        /// Stop after this many seconds instead of waiting for enter on stdin
        #[arg(short, long)]
        duration: Option<u64>,

        /// Increase log verbosity (-v, -vv, -vvv)
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    }

    pub fn run() -> Result<(), Box<dyn std::error::Error>> {
        let args = Args::parse();
        init_logging(args.verbose.saturating_add(1))?;

        // SAFETY: the descriptor was passed to us to own, nothing else in this process uses it
        let tunnel = unsafe { FdTunnel::from_raw_fd(args.fd) }?;
        let mut capturer = Capturer::default();
        capturer.start(tunnel, &args.output)?;

        match args.duration {
            Some(secs) => sleep(Duration::from_secs(secs)),
            None => {
                info!("press enter to stop");
                let mut line = String::new();
                stdin().read_line(&mut line)?;
            }
        }

        if let Some(outcome) = capturer.stop() {
            let stats = outcome?;
            println!("Captured {} packets ({} bytes) to {}", stats.packets, stats.bytes, args.output.display());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    cli::run()
}

#[cfg(not(unix))]
fn main() {
    eprintln!("Capturing needs a unix tunnel descriptor");
    std::process::exit(1);
}
