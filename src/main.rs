use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tracing_indicatif::style::ProgressStyle;
use rand::Rng as _;
use std::{io, path::PathBuf, time::Duration};
use tracing::{info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[macro_use]
extern crate lazy_static;

mod config;
mod confirm;
mod fio;
mod metadata;
mod orchestrator;
mod plan;
mod session_log;
mod summary;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux::{sanity_checks, ValidDevice};

#[cfg(not(target_os = "linux"))]
mod other_os;
#[cfg(not(target_os = "linux"))]
use other_os::{sanity_checks, ValidDevice};

use config::{ByteSize, OutputFormat, RunConfig, RwMode};
use fio::FioBinary;
use orchestrator::Orchestrator;
use plan::{Axis, Schedule, SweepPlan, Volume};
use session_log::SessionLog;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Fill a region of a device, then sweep fio over it, logging every run.
    ///
    /// THIS DESTROYS DATA in the region between --offset and --offset + --size
    /// (or the largest --sweep-volumes size).
    Run(RunArgs),

    /// Print a table of results from a finished session.
    Summarize(SummarizeArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Block device to benchmark (e.g. /dev/nvme0n1).
    #[clap(value_parser = clap::value_parser!(ValidDevice))]
    device: ValidDevice,

    #[command(flatten)]
    settings: SweepSettings,

    /// Directory for session logs; created if missing.
    #[clap(long, default_value = "fio-logs")]
    log_dir: PathBuf,

    /// Kill any single fio run after this many seconds.
    #[clap(long)]
    timeout: Option<u64>,

    /// Path to the fio binary. Defaults to the one on PATH.
    #[clap(long)]
    fio: Option<PathBuf>,

    /// Don't ask before overwriting the test region.
    #[clap(long)]
    yes: bool,

    /// Print the fio command lines and exit without running anything.
    #[clap(long)]
    dry_run: bool,

    /// Run the benchmark even if the given path is a block device but not
    /// a disk (e.g. a single partition).
    #[clap(long)]
    allow_any_block_device: bool,

    /// Partition and mount checks are unavailable on this platform; pass this to run anyway.
    #[cfg(not(target_os = "linux"))]
    #[clap(long)]
    i_know_what_im_doing_let_me_skip_sanity_checks: bool,
}

/// What gets run: the test region, the base parameters, the axes and the fill pass.
#[derive(clap::Args, Debug, Clone)]
struct SweepSettings {
    /// Start of the test region on the device.
    #[clap(long, default_value = "1g")]
    offset: ByteSize,

    /// Length of the test region.
    #[clap(long, default_value = "1g")]
    size: ByteSize,

    /// Block size for runs that don't sweep it.
    #[clap(long, default_value = "4k")]
    block_size: ByteSize,

    /// Queue depth for runs that don't sweep it.
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    queue_depth: u32,

    /// Number of fio jobs for runs that don't sweep it.
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    jobs: u32,

    /// Access pattern for runs that don't sweep it.
    #[clap(long, value_enum, default_value_t = RwMode::RandRead)]
    mode: RwMode,

    /// Percentage of reads in the mixed modes (rw, randrw).
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    rwmix_read: Option<u8>,

    /// Run each measurement for this many seconds instead of until the
    /// region has been covered once.
    #[clap(long)]
    runtime: Option<u64>,

    /// fio I/O engine.
    #[clap(long, default_value = "libaio")]
    ioengine: String,

    /// fio output format. With `json`, each measurement also gets its own
    /// result file next to the session log.
    #[clap(long, value_enum, default_value_t = OutputFormat::Normal)]
    output_format: OutputFormat,

    /// Extra arguments passed verbatim to every measurement run.
    #[clap(long, allow_hyphen_values = true)]
    extra: Vec<String>,

    /// Volumes to sweep, as label:size:mode (e.g. small_seq:64m:write,large_rand:1g:randwrite).
    #[clap(long, value_delimiter = ',')]
    sweep_volumes: Vec<Volume>,

    /// Block sizes to sweep (e.g. 4k,16k,64k,128k).
    #[clap(long, value_delimiter = ',')]
    sweep_block_sizes: Vec<ByteSize>,

    /// Job counts to sweep (e.g. 1,2,4,8).
    #[clap(long, value_delimiter = ',', value_parser = clap::value_parser!(u32).range(1..))]
    sweep_jobs: Vec<u32>,

    /// Access patterns to sweep (e.g. write,randwrite,rw,randrw).
    #[clap(long, value_enum, value_delimiter = ',')]
    sweep_modes: Vec<RwMode>,

    /// Queue depths to sweep. If no sweep is given at all, 1,2,4,...,64 is used.
    #[clap(long, value_delimiter = ',', value_parser = clap::value_parser!(u32).range(1..))]
    sweep_queue_depths: Vec<u32>,

    /// Block size of the fill pass.
    #[clap(long, default_value = "128k")]
    prefill_block_size: ByteSize,

    /// Queue depth of the fill pass.
    #[clap(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..))]
    prefill_queue_depth: u32,

    /// How many times the fill pass writes the region.
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    prefill_loops: u32,

    /// Seed for fio's random patterns; random if not given. Logged either way.
    #[clap(long)]
    seed: Option<u64>,
}

impl SweepSettings {
    fn base_config(&self, device: PathBuf) -> anyhow::Result<RunConfig> {
        if self.block_size.bytes() == 0 {
            anyhow::bail!("Block size must not be zero");
        }
        Ok(RunConfig {
            name: "base".to_string(),
            device,
            offset: self.offset,
            size: self.size,
            block_size: self.block_size,
            mode: self.mode,
            rwmix_read: self.rwmix_read,
            queue_depth: self.queue_depth,
            jobs: self.jobs,
            runtime: self.runtime.map(Duration::from_secs),
            ioengine: self.ioengine.clone(),
            output_format: self.output_format,
            randseed: None,
            extra: self.extra.clone(),
        })
    }

    fn sweep_plan(&self) -> anyhow::Result<SweepPlan> {
        SweepPlan::from_axes([
            Axis::Volume(self.sweep_volumes.clone()),
            Axis::BlockSize(self.sweep_block_sizes.clone()),
            Axis::Jobs(self.sweep_jobs.clone()),
            Axis::Mode(self.sweep_modes.clone()),
            Axis::QueueDepth(self.sweep_queue_depths.clone()),
        ])
    }

    /// Builds every run of the session and checks each one against a device
    /// of `capacity` bytes. Nothing here touches the device.
    fn plan_session(&self, device: PathBuf, capacity: u64) -> anyhow::Result<(Schedule, u64)> {
        let base = self.base_config(device)?;
        let sweep = self.sweep_plan()?;
        // The fill pass covers every region a step will measure.
        let filled = RunConfig {
            size: sweep.largest_region(&base),
            ..base.clone()
        };
        let prefill = plan::prefill_config(
            &filled,
            self.prefill_block_size,
            self.prefill_queue_depth,
            self.prefill_loops,
        );
        let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let axes: Vec<String> = sweep.axes().iter().map(ToString::to_string).collect();
        info!(device = ?base.device, capacity, seed, ?axes, "Planning session");

        let schedule = sweep.schedule(&base, prefill, seed);
        schedule
            .validate(capacity)
            .context("Checking test regions against the device")?;
        Ok((schedule, seed))
    }
}

#[derive(clap::Args, Debug)]
struct SummarizeArgs {
    /// A session log (fio_test_*.log), or a directory of JSON results.
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
    let args = Args::parse();

    match args.command {
        Command::Run(args) => run(args),
        Command::Summarize(args) => summarize(args),
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let ValidDevice {
        device,
        partition,
        path,
    } = args.device.clone();
    sanity_checks(&args, partition, &path, &device)?;

    let capacity = metadata::device_capacity(&path).context("Querying device capacity")?;
    let (schedule, seed) = args.settings.plan_session(path.clone(), capacity)?;

    if args.dry_run {
        for config in schedule.configs() {
            println!("{}", fio::command_line("fio", &fio::arguments(config)));
        }
        return Ok(());
    }

    let filled = &schedule.prefill;
    if args.yes {
        warn!(?path, offset = %filled.offset, "Skipping confirmation; the test region will be overwritten");
    } else {
        confirm::confirm_destruction(
            &path,
            filled.offset,
            filled.size,
            io::stdin().lock(),
            io::stderr(),
        )?;
    }

    let fio = FioBinary::locate(args.fio.as_deref(), args.timeout.map(Duration::from_secs))?;
    let mut log = SessionLog::create(&args.log_dir, Local::now())?;
    log.note(&format!(
        "device={} capacity={} seed={} fio={}",
        path.display(),
        capacity,
        seed,
        fio.path.display()
    ))?;
    info!(log = ?log.path(), "Starting session");

    let mut orchestrator = Orchestrator::new(fio, log);
    let report = orchestrator
        .run(&schedule)
        .context("During benchmark session")?;
    if report.failed.is_empty() {
        info!(
            runs = report.attempted,
            entries = orchestrator.log().entries(),
            phase = ?orchestrator.phase(),
            log = ?orchestrator.log().path(),
            "All runs completed"
        );
    } else {
        warn!(
            runs = report.attempted,
            failed = ?report.failed,
            entries = orchestrator.log().entries(),
            log = ?orchestrator.log().path(),
            "Session completed with failed runs"
        );
    }
    Ok(())
}

fn summarize(args: SummarizeArgs) -> anyhow::Result<()> {
    let summary = summary::summarize(&args.path)
        .with_context(|| format!("Summarizing {:?}", args.path))?;
    if summary.cases.is_empty() {
        warn!(path = ?args.path, "No successful measurement runs found");
    }
    print!("{summary}");
    Ok(())
}

lazy_static! {
    pub(crate) static ref PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.white/grey} {pos}/{len} runs (ETA {eta_precise}) {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
}
