//! Threaded run loop: a reader feeding the flow engine, which feeds the flow writer and, through
//! banner extraction, the banner writer. Every stage is joined by a bounded channel so a slow
//! writer pushes back on the capture instead of dropping records.

use std::{
    fmt,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{info, warn};
use serde::Serialize;

use crate::{
    banner::{Banner, BannerMatcher},
    capture::{CaptureSource, Captured, READ_TIMEOUT_MS},
    config::Config,
    engine::{EngineStats, FlowEngine, FlowSink},
    error::Result,
    output::JsonLinesWriter,
    packet::MetaPacket,
    record::{FirstPayload, Flow},
};

/// Depth of every channel between stages.
pub const QUEUE_DEPTH: usize = 256;

/// Live packets may still sit in the capture buffer this long after a read timeout.
const TICK_SLACK: Duration = Duration::from_millis(READ_TIMEOUT_MS as u64);

/// What the reader hands the engine.
#[derive(Debug)]
pub enum Input {
    Packet(MetaPacket),
    /// No traffic for this long.
    Tick(Duration),
}

pub trait PacketSource {
    /// `Ok(None)` ends the run.
    fn next_input(&mut self) -> Result<Option<Input>>;
}

impl PacketSource for CaptureSource {
    fn next_input(&mut self) -> Result<Option<Input>> {
        loop {
            match self.next_packet()? {
                Some(Captured::Packet(mp)) => return Ok(Some(Input::Packet(mp))),
                Some(Captured::Timeout) => {
                    return Ok(Some(Input::Tick(TICK_SLACK)))
                }
                Some(Captured::Skipped) => continue,
                None => return Ok(None),
            }
        }
    }
}

/// Replays already decoded packets.
pub struct Replay<I>(pub I);

impl<I: Iterator<Item = MetaPacket>> PacketSource for Replay<I> {
    fn next_input(&mut self) -> Result<Option<Input>> {
        Ok(self.0.next().map(Input::Packet))
    }
}

/// Where a stream of records ends up.
pub enum Target {
    File(PathBuf),
    /// Serialize and count, but store nothing.
    Discard,
    Writer(Box<dyn Write + Send>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(path) => write!(f, "File({})", path.display()),
            Target::Discard => f.write_str("Discard"),
            Target::Writer(_) => f.write_str("Writer"),
        }
    }
}

#[derive(Debug)]
pub struct Outputs {
    pub flows: Target,
    /// `None` turns banner extraction off.
    pub banners: Option<Target>,
    pub print_flows: bool,
    pub print_banners: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub engine: EngineStats,
    /// Packets already read when the run was interrupted, dropped without assignment.
    pub packets_discarded: u64,
    pub flows_written: u64,
    pub banners_written: u64,
    pub interrupted: bool,
}

/// Forwards engine output to the writer stages. Sends block while a stage is behind.
struct ChannelSink {
    flows: Option<SyncSender<Flow>>,
    payloads: Option<SyncSender<FirstPayload>>,
}

impl FlowSink for ChannelSink {
    fn emit_flow(&mut self, flow: Flow) {
        if let Some(tx) = &self.flows {
            if tx.send(flow).is_err() {
                warn!("flow writer has stopped, discarding further flows");
                self.flows = None;
            }
        }
    }

    fn emit_payload(&mut self, payload: FirstPayload) {
        if let Some(tx) = &self.payloads {
            if tx.send(payload).is_err() {
                warn!("banner extraction has stopped, discarding further payloads");
                self.payloads = None;
            }
        }
    }
}

/// Runs `source` to exhaustion (or until `shutdown` is raised) and waits for every stage to
/// drain. Open flows are always finalized, including after an interrupt.
pub fn run<S: PacketSource>(
    config: &Config,
    matcher: Option<BannerMatcher>,
    outputs: Outputs,
    shutdown: Arc<AtomicBool>,
    source: &mut S,
) -> Result<RunSummary> {
    let (input_tx, input_rx) = sync_channel::<Input>(QUEUE_DEPTH);
    let (flow_tx, flow_rx) = sync_channel::<Flow>(QUEUE_DEPTH);

    let flow_writer = spawn_writer("flow-writer", outputs.flows, flow_rx, outputs.print_flows)?;

    let (payload_tx, banner_stages) = match (matcher, outputs.banners) {
        (Some(matcher), Some(target)) if config.extract_banners => {
            let (payload_tx, payload_rx) = sync_channel::<FirstPayload>(QUEUE_DEPTH);
            let (banner_tx, banner_rx) = sync_channel::<Banner>(QUEUE_DEPTH);
            let extractor = thread::Builder::new()
                .name("banners".into())
                .spawn(move || extract_banners(matcher, payload_rx, banner_tx))?;
            let writer = spawn_writer("banner-writer", target, banner_rx, outputs.print_banners)?;
            (Some(payload_tx), Some((extractor, writer)))
        }
        _ => (None, None),
    };

    let engine = {
        let mut engine_config = config.clone();
        engine_config.extract_banners = payload_tx.is_some();
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new().name("engine".into()).spawn(move || {
            let mut engine = FlowEngine::new(&engine_config);
            let mut sink = ChannelSink {
                flows: Some(flow_tx),
                payloads: payload_tx,
            };
            let mut discarded = 0;
            for input in input_rx {
                if shutdown.load(Ordering::Relaxed) {
                    // keep draining until the reader notices the flag and hangs up
                    if let Input::Packet(_) = input {
                        discarded += 1;
                    }
                    continue;
                }
                match input {
                    Input::Packet(mp) => {
                        engine.process(&mp, &mut sink);
                    }
                    Input::Tick(elapsed) => {
                        let ceiling = SystemTime::now()
                            .checked_sub(TICK_SLACK)
                            .unwrap_or(UNIX_EPOCH);
                        engine.tick_until(elapsed, ceiling, &mut sink);
                    }
                }
            }
            if discarded > 0 {
                warn!("discarded {} queued packets after interrupt", discarded);
            }
            engine.finalize(&mut sink);
            (engine.stats().clone(), discarded)
        })?
    };

    let mut interrupted = false;
    let read_result = loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("interrupted, finalizing open flows");
            interrupted = true;
            break Ok(());
        }
        match source.next_input() {
            Ok(Some(input)) => {
                if input_tx.send(input).is_err() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    drop(input_tx);

    let (engine_stats, packets_discarded) = join(engine);
    let mut summary = RunSummary {
        engine: engine_stats,
        packets_discarded,
        interrupted,
        ..RunSummary::default()
    };
    summary.flows_written = join(flow_writer)?;
    if let Some((extractor, writer)) = banner_stages {
        join(extractor);
        summary.banners_written = join(writer)?;
    }
    read_result?;
    Ok(summary)
}

fn spawn_writer<T>(
    name: &str,
    target: Target,
    rx: Receiver<T>,
    print: bool,
) -> Result<JoinHandle<Result<u64>>>
where
    T: Serialize + fmt::Display + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || match target {
            Target::File(path) => drain(JsonLinesWriter::create(path)?, rx, print),
            Target::Discard => drain(JsonLinesWriter::discard(), rx, print),
            Target::Writer(w) => drain(JsonLinesWriter::new(w), rx, print),
        })?;
    Ok(handle)
}

fn drain<W: Write, T: Serialize + fmt::Display>(
    mut out: JsonLinesWriter<W>,
    rx: Receiver<T>,
    print: bool,
) -> Result<u64> {
    for record in rx {
        if print {
            println!("{}", record);
        }
        out.write(&record)?;
    }
    let written = out.written();
    out.finish()?;
    Ok(written)
}

fn extract_banners(matcher: BannerMatcher, rx: Receiver<FirstPayload>, tx: SyncSender<Banner>) {
    for payload in rx {
        for banner in matcher.extract(&payload) {
            if tx.send(banner).is_err() {
                warn!("banner writer has stopped");
                return;
            }
        }
    }
}

fn join<T>(handle: JoinHandle<T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}
