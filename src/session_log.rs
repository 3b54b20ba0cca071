//! The append-only record of a benchmark session.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Local};

use crate::config::RunConfig;
use crate::fio::Invocation;

/// One aggregate log file per session, named after the session start time,
/// plus a directory for per-run JSON artifacts next to it.
#[derive(Debug)]
pub(crate) struct SessionLog {
    path: PathBuf,
    artifact_dir: PathBuf,
    file: File,
    entries: usize,
}

impl SessionLog {
    /// Creates `<dir>/fio_test_<YYYYMMDD_HHMMSS>.log`, creating `dir` if needed.
    ///
    /// Refuses to append to a log left behind by another session.
    pub(crate) fn create(dir: &Path, started: DateTime<Local>) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Creating log directory {:?}", dir))?;
        let stem = format!("fio_test_{}", started.format("%Y%m%d_%H%M%S"));
        let path = dir.join(format!("{stem}.log"));
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Creating session log {:?}", path))?;
        Ok(Self {
            path,
            artifact_dir: dir.join(stem),
            file,
            entries: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Number of run entries recorded so far.
    pub(crate) fn entries(&self) -> usize {
        self.entries
    }

    /// Writes a free-form line that isn't tied to a run.
    pub(crate) fn note(&mut self, line: &str) -> anyhow::Result<()> {
        writeln!(self.file, "# {line}")?;
        self.file.flush().context("Flushing session log")
    }

    /// Appends one run entry; `outcome` is `Err` when fio could not be started.
    pub(crate) fn record(
        &mut self,
        config: &RunConfig,
        started: DateTime<Local>,
        command: &str,
        outcome: Result<&Invocation, &anyhow::Error>,
    ) -> anyhow::Result<()> {
        let mut entry = format!(
            "--- Running: {} ({}) ---\nstarted: {}\ncommand: {}\n",
            config.name,
            config.describe(),
            started.to_rfc3339(),
            command
        );
        match outcome {
            Ok(invocation) => {
                push_block(&mut entry, &invocation.stdout);
                if !invocation.stderr.is_empty() {
                    entry.push_str("--- stderr ---\n");
                    push_block(&mut entry, &invocation.stderr);
                }
                entry.push_str(&format!(
                    "--- Finished: {} status={} elapsed={:.2}s ---\n\n",
                    config.name,
                    invocation.exit,
                    invocation.elapsed.as_secs_f64()
                ));
            }
            Err(error) => {
                entry.push_str(&format!("{error:#}\n"));
                entry.push_str(&format!(
                    "--- Finished: {} status=not-started ---\n\n",
                    config.name
                ));
            }
        }
        self.file
            .write_all(entry.as_bytes())
            .with_context(|| format!("Appending to session log {:?}", self.path))?;
        self.file.flush().context("Flushing session log")?;
        self.entries += 1;
        Ok(())
    }

    /// Stores fio's structured output for one run as `<name>.json`.
    pub(crate) fn write_artifact(&mut self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.artifact_dir)
            .with_context(|| format!("Creating artifact directory {:?}", self.artifact_dir))?;
        let path = self.artifact_dir.join(format!("{name}.json"));
        fs::write(&path, contents).with_context(|| format!("Writing {:?}", path))?;
        Ok(path)
    }
}

fn push_block(entry: &mut String, text: &str) {
    entry.push_str(text);
    if !text.is_empty() && !text.ends_with('\n') {
        entry.push('\n');
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fio::Exit;
    use crate::plan::test::base;
    use chrono::TimeZone;
    use std::time::Duration;

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 2, 26, 5, 50, 9).unwrap()
    }

    #[test]
    fn names_log_after_session_start() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = SessionLog::create(&dir.path().join("nested/logs"), started()).expect("log");
        assert_eq!(
            log.path().file_name().and_then(|n| n.to_str()),
            Some("fio_test_20260226_055009.log")
        );
        assert!(log.path().exists());
    }

    #[test]
    fn refuses_to_reuse_a_log() {
        let dir = tempfile::tempdir().expect("temp dir");
        let _first = SessionLog::create(dir.path(), started()).expect("first log");
        assert!(SessionLog::create(dir.path(), started()).is_err());
    }

    #[test]
    fn records_successes_and_failures_in_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut log = SessionLog::create(dir.path(), started()).expect("log");
        let ok = Invocation {
            stdout: "qd_scan_1: (groupid=0, jobs=1): err= 0".to_string(),
            stderr: String::new(),
            exit: Exit::Code(0),
            elapsed: Duration::from_millis(1500),
        };
        let config = RunConfig {
            name: "qd_scan_1".to_string(),
            ..base()
        };
        log.record(&config, started(), "fio --name=qd_scan_1", Ok(&ok))
            .expect("record success");
        let missing = anyhow::anyhow!("No such file or directory");
        let config = RunConfig {
            name: "qd_scan_2".to_string(),
            ..base()
        };
        log.record(&config, started(), "fio --name=qd_scan_2", Err(&missing))
            .expect("record failure");
        assert_eq!(log.entries(), 2);

        let contents = fs::read_to_string(log.path()).expect("read log");
        let first = contents.find("--- Running: qd_scan_1 (RW=randread, BS=4k, Jobs=1, QD=1, Size=1g, Time=3s) ---");
        let second = contents.find("--- Running: qd_scan_2");
        assert!(first.is_some());
        assert!(first < second);
        assert!(contents.contains("--- Finished: qd_scan_1 status=0 elapsed=1.50s ---"));
        assert!(contents.contains("No such file or directory\n--- Finished: qd_scan_2 status=not-started ---"));
    }

    #[test]
    fn writes_artifacts_next_to_log() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut log = SessionLog::create(dir.path(), started()).expect("log");
        let path = log.write_artifact("bs_4k", "{}").expect("artifact");
        assert_eq!(path, dir.path().join("fio_test_20260226_055009/bs_4k.json"));
        assert_eq!(fs::read_to_string(path).expect("read artifact"), "{}");
    }
}
