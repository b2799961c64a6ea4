use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

use flowtap::{
    banner::BannerMatcher,
    capture::CaptureSource,
    pipeline::{self, Outputs, Target},
    Config, FinPolicy,
};

/// Assign packets from a pcap file or a live device to flows.
#[derive(Parser)]
struct Opts {
    /// pcap file to read
    input: Option<PathBuf>,
    /// capture live from this device instead of a file
    #[clap(long, short = 'i', conflicts_with = "input")]
    device: Option<String>,
    #[clap(long, default_value = "65535")]
    snaplen: i32,
    /// JSON file with engine settings; flags below override it
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,
    /// seconds
    #[clap(long)]
    active_timeout: Option<u64>,
    /// seconds
    #[clap(long)]
    idle_timeout: Option<u64>,
    #[clap(long)]
    capacity: Option<usize>,
    #[clap(long)]
    filter_small_flows: bool,
    #[clap(long)]
    filter_tcp_flags: bool,
    /// only end a TCP flow on RST, or on ACK after a FIN
    #[clap(long)]
    fin_ack: bool,
    /// JSON array of banner search terms
    #[clap(long, short = 'b')]
    banner_terms: Option<PathBuf>,
    #[clap(long, short = 'o', default_value = "out")]
    output_dir: PathBuf,
    /// serialize records but write nothing
    #[clap(long)]
    discard: bool,
    #[clap(long)]
    print_flows: bool,
    #[clap(long)]
    print_banners: bool,
    #[clap(long, short = 'v')]
    verbose: bool,
}

impl Opts {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(secs) = self.active_timeout {
            config.active_timeout = secs;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout = secs;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        config.filter_small_flows |= self.filter_small_flows;
        config.filter_tcp_flags |= self.filter_tcp_flags;
        if self.fin_ack {
            config.fin_policy = FinPolicy::FinAckOrRst;
        }
        if self.banner_terms.is_none() {
            config.extract_banners = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn target(&self, name: &str) -> Target {
        if self.discard {
            Target::Discard
        } else {
            Target::File(self.output_dir.join(name))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = opts.config()?;
    let matcher = match &opts.banner_terms {
        Some(path) => Some(
            BannerMatcher::from_file(path)
                .with_context(|| format!("loading banner terms from {}", path.display()))?,
        ),
        None => None,
    };

    let mut source = match (&opts.input, &opts.device) {
        (Some(path), None) => CaptureSource::open_file(path)?,
        (None, Some(device)) => CaptureSource::open_device(device, opts.snaplen)?,
        _ => bail!("pass either a pcap file or --device"),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("not able to set ctrl-c handler")?;
    }
    if source.is_live() {
        info!("press ctrl-c to stop and flush open flows");
    }

    let outputs = Outputs {
        flows: opts.target("flows.json"),
        banners: matcher.as_ref().map(|_| opts.target("banners.json")),
        print_flows: opts.print_flows,
        print_banners: opts.print_banners,
    };

    let summary = pipeline::run(&config, matcher, outputs, shutdown, &mut source)?;

    let capture = source.stats();
    info!(
        "read {} packets ({} bytes): {} decoded, {} non-ip, {} undecodable, {} truncated",
        capture.packets,
        capture.bytes,
        capture.decoded,
        capture.non_ip,
        capture.undecodable,
        capture.truncated
    );
    let engine = &summary.engine;
    info!(
        "{} flows: {} emitted, {} filtered, {} evicted; {} out of order, {} stale",
        engine.flows_created,
        engine.flows_emitted,
        engine.flows_filtered,
        engine.evictions,
        engine.packets_out_of_order,
        engine.packets_dropped_stale
    );
    println!(
        "{}",
        serde_json::json!({ "capture": capture, "run": &summary })
    );

    Ok(())
}
