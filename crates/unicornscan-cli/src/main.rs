//! unicornscan CLI entry point
//!
//! Parses the flag surface, assembles the scan settings, opens the output
//! sinks, and hands everything to the master. Results go to stdout; logs
//! and errors go to stderr. Exit code 0 on success (including interrupted
//! scans, which flush first); non-zero on any fatal init error.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use unicornscan_cli::args::Args;
use unicornscan_cli::output;
use unicornscan_scanner::{build_sinks, Master, OutputSink, TextSink};

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("unicornscan={}", default)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        output::fatal('M', &e.to_string());
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = args.build_settings()?;

    // Raw capture and injection want privileges; warn early so the pcap
    // error further down is no surprise.
    if !nix::unistd::geteuid().is_root() {
        info!("not running as root; capture may need CAP_NET_RAW");
    }

    // A custom template replaces the stock text sink; explicitly requested
    // modules still run alongside it.
    let sink_names = args.sink_names();
    let sinks: Vec<Box<dyn OutputSink>> = match &settings.format {
        Some(template) => {
            let templated: Box<dyn OutputSink> =
                Box::new(TextSink::stdout().with_template(template.clone()));
            if sink_names.is_empty() {
                vec![templated]
            } else {
                let mut sinks = build_sinks(&sink_names)?;
                sinks.insert(0, templated);
                sinks
            }
        }
        None => build_sinks(&sink_names)?,
    };

    info!(
        scan_id = %settings.scan_id,
        phases = settings.phases.len(),
        targets = settings.targets.len(),
        pps = settings.pps,
        "scan starting"
    );

    let master = Master::new(settings, sinks)?;
    master.run().await?;
    Ok(())
}
