//! Running fio as an opaque subprocess.

use std::{
    fmt,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::process::CommandExt as _;

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::config::RunConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a timed-out fio gets to stop its jobs after SIGTERM.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Code(i32),
    /// Killed by a signal we did not send.
    Signal,
    /// Killed by us after exceeding the per-run timeout.
    TimedOut,
}

impl Exit {
    pub(crate) fn success(self) -> bool {
        self == Exit::Code(0)
    }
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        status.code().map(Exit::Code).unwrap_or(Exit::Signal)
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "{code}"),
            Exit::Signal => f.write_str("signal"),
            Exit::TimedOut => f.write_str("timeout"),
        }
    }
}

/// Everything a finished fio process left behind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Invocation {
    pub stdout: String,
    pub stderr: String,
    pub exit: Exit,
    pub elapsed: Duration,
}

/// Something that can run fio with an argument list and wait for it.
///
/// An `Err` means the process could not be run at all; a process that ran
/// and failed is an `Ok` with a non-successful [`Exit`].
pub(crate) trait Invoker {
    fn invoke(&mut self, args: &[String]) -> anyhow::Result<Invocation>;

    /// The program name to show when printing a command line.
    fn program(&self) -> String {
        "fio".to_string()
    }
}

/// The real fio binary.
#[derive(Debug, Clone)]
pub(crate) struct FioBinary {
    pub path: PathBuf,
    /// Kill runs that take longer than this.
    pub timeout: Option<Duration>,
}

impl FioBinary {
    /// Uses `explicit` if given, otherwise looks for `fio` on the `PATH`.
    pub(crate) fn locate(explicit: Option<&Path>, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("fio binary {:?} does not exist", path);
                }
                path.to_path_buf()
            }
            None => which::which("fio")
                .context("fio not found in PATH - install it or pass --fio <path>")?,
        };
        Ok(Self { path, timeout })
    }

    fn wait(&self, child: &mut Child) -> anyhow::Result<Exit> {
        let Some(limit) = self.timeout else {
            return Ok(child.wait().context("Waiting for fio")?.into());
        };
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait().context("Polling fio")? {
                return Ok(status.into());
            }
            if started.elapsed() >= limit {
                warn!(?limit, pid = child.id(), "fio exceeded its time limit; stopping it");
                stop(child)?;
                return Ok(Exit::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Invoker for FioBinary {
    fn invoke(&mut self, args: &[String]) -> anyhow::Result<Invocation> {
        let started = Instant::now();
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // fio forks one process per job; a group lets a timeout reach all of them.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .with_context(|| format!("Starting {:?}", self.path))?;
        debug!(pid = child.id(), "fio started");
        // Both pipes are drained concurrently so a full stderr can't stall fio.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let exit = self.wait(&mut child)?;
        Ok(Invocation {
            stdout: join(stdout)?,
            stderr: join(stderr)?,
            exit,
            elapsed: started.elapsed(),
        })
    }

    fn program(&self) -> String {
        self.path.display().to_string()
    }
}

/// Stops a timed-out fio together with every job process it forked, so
/// nothing keeps writing to the device once the run is over.
#[cfg(unix)]
fn stop(child: &mut Child) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    if let Err(error) = killpg(group, Signal::SIGTERM) {
        warn!(%error, "Could not terminate fio");
    }
    let asked = Instant::now();
    while child.try_wait().context("Polling fio")?.is_none() && asked.elapsed() < TERM_GRACE {
        thread::sleep(POLL_INTERVAL);
    }
    // Jobs can outlive their parent, so the group gets killed either way.
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(error) => warn!(%error, "Could not kill fio's process group"),
    }
    child.wait().context("Reaping killed fio")?;
    Ok(())
}

#[cfg(not(unix))]
fn stop(child: &mut Child) -> anyhow::Result<()> {
    if let Err(error) = child.kill() {
        warn!(%error, "Could not kill fio");
    }
    child.wait().context("Reaping killed fio")?;
    Ok(())
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut bytes)?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
}

fn join(handle: JoinHandle<std::io::Result<String>>) -> anyhow::Result<String> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("Output reader thread panicked"))?
        .context("Reading fio output")
}

/// The fio argument list for one run.
pub(crate) fn arguments(config: &RunConfig) -> Vec<String> {
    let mut args = vec![
        format!("--name={}", config.name),
        format!("--filename={}", config.device.display()),
        format!("--offset={}", config.offset),
        format!("--size={}", config.size),
        format!("--rw={}", config.mode),
        format!("--bs={}", config.block_size),
        format!("--iodepth={}", config.queue_depth),
        format!("--numjobs={}", config.jobs),
        "--direct=1".to_string(),
        format!("--ioengine={}", config.ioengine),
        "--group_reporting".to_string(),
        format!("--output-format={}", config.output_format.as_fio()),
    ];
    if let (true, Some(percent)) = (config.mode.is_mixed(), config.rwmix_read) {
        args.push(format!("--rwmixread={percent}"));
    }
    if let Some(runtime) = config.runtime {
        args.push("--time_based".to_string());
        args.push(format!("--runtime={}", runtime.as_secs()));
    }
    if let Some(seed) = config.randseed {
        args.push(format!("--randseed={seed}"));
    }
    args.extend(config.extra.iter().cloned());
    args
}

/// A copy-pasteable rendition of a command line.
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
