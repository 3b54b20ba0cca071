//! Driving fio through a session: fill first, then every sweep step in order.

use anyhow::Context as _;
use chrono::Local;
use tracing::{info, info_span, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::{OutputFormat, RunConfig};
use crate::fio::{self, Invocation, Invoker};
use crate::plan::{Schedule, Step};
use crate::session_log::SessionLog;
use crate::PROGRESS_STYLE;

/// Where a session currently is. Phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    Precondition,
    Sweep(&'static str),
    Done,
}

/// What a completed session did.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SessionReport {
    pub attempted: usize,
    /// Names of the steps that did not exit cleanly.
    pub failed: Vec<String>,
}

/// Runs fio, one process at a time, and records every attempt.
pub(crate) struct Orchestrator<I: Invoker> {
    invoker: I,
    log: SessionLog,
    phase: Phase,
}

impl<I: Invoker> Orchestrator<I> {
    pub(crate) fn new(invoker: I, log: SessionLog) -> Self {
        Self {
            invoker,
            log,
            phase: Phase::Init,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn log(&self) -> &SessionLog {
        &self.log
    }

    fn enter(&mut self, phase: Phase) -> anyhow::Result<()> {
        info!(from = ?self.phase, to = ?phase, "Session phase change");
        self.log.note(&format!("phase: {phase:?}"))?;
        self.phase = phase;
        Ok(())
    }

    /// Runs a whole session. The only errors are fatal ones: a failed fill
    /// pass or a session log that can't be written.
    pub(crate) fn run(&mut self, schedule: &Schedule) -> anyhow::Result<SessionReport> {
        self.precondition(&schedule.prefill)?;
        let report = self.run_sweep(&schedule.steps)?;
        self.enter(Phase::Done)?;
        self.log.note(&format!(
            "done: {} runs attempted, {} failed",
            report.attempted,
            report.failed.len()
        ))?;
        Ok(report)
    }

    /// Writes the whole test region once. Any failure ends the session.
    #[tracing::instrument(skip_all, fields(case = %config.name))]
    pub(crate) fn precondition(&mut self, config: &RunConfig) -> anyhow::Result<()> {
        self.enter(Phase::Precondition)?;
        let outcome = self.execute(config)?;
        let invocation = outcome.map_err(|error| error.context("Fill pass could not run"))?;
        if let Some(reason) = failure(&invocation) {
            anyhow::bail!("Fill pass failed ({reason}); see {:?}", self.log.path());
        }
        info!(elapsed = ?invocation.elapsed, "Fill pass complete");
        Ok(())
    }

    /// Attempts every step exactly once, in order. A failing step is logged
    /// and the sweep moves on.
    #[tracing::instrument(name = "sweep", skip_all)]
    pub(crate) fn run_sweep(&mut self, steps: &[Step]) -> anyhow::Result<SessionReport> {
        Span::current().pb_set_style(&PROGRESS_STYLE);
        Span::current().pb_set_length(steps.len() as u64);

        let mut report = SessionReport::default();
        for step in steps {
            if self.phase != Phase::Sweep(step.axis) {
                self.enter(Phase::Sweep(step.axis))?;
            }
            let config = &step.config;
            Span::current().pb_set_message(&config.name);
            let outcome = self.execute(config)?;
            report.attempted += 1;
            match outcome {
                Ok(invocation) => match failure(&invocation) {
                    None if config.output_format == OutputFormat::Json => {
                        if !self.store_result(config, &invocation)? {
                            report.failed.push(config.name.clone());
                        }
                    }
                    None => {}
                    Some(reason) => {
                        warn!(case = %config.name, %reason, "fio run failed; continuing");
                        self.log.note(&format!("{}: failed ({reason})", config.name))?;
                        report.failed.push(config.name.clone());
                    }
                },
                Err(error) => {
                    warn!(case = %config.name, error = %format!("{error:#}"), "fio could not be started; continuing");
                    report.failed.push(config.name.clone());
                }
            }
            Span::current().pb_inc(1);
        }
        Ok(report)
    }

    /// Writes a run's JSON result next to the session log. A result that
    /// can't be stored fails that run only; the return says whether it was.
    fn store_result(&mut self, config: &RunConfig, invocation: &Invocation) -> anyhow::Result<bool> {
        match self.log.write_artifact(&config.name, &invocation.stdout) {
            Ok(artifact) => {
                info!(case = %config.name, ?artifact, "Stored JSON result");
                Ok(true)
            }
            Err(error) => {
                warn!(case = %config.name, error = %format!("{error:#}"), "Could not store JSON result; continuing");
                self.log
                    .note(&format!("{}: result not stored: {error:#}", config.name))?;
                Ok(false)
            }
        }
    }

    /// Runs fio once and records the attempt. The outer error is for the
    /// session log; the inner one is for fio failing to start.
    fn execute(&mut self, config: &RunConfig) -> anyhow::Result<Result<Invocation, anyhow::Error>> {
        let _span = info_span!("run", case = %config.name).entered();
        let args = fio::arguments(config);
        let command = fio::command_line(&self.invoker.program(), &args);
        let started = Local::now();
        info!(%command, "Running fio");
        let outcome = self.invoker.invoke(&args);
        self.log
            .record(config, started, &command, outcome.as_ref())
            .context("Recording run result")?;
        Ok(outcome)
    }
}

/// Why a run that did finish still doesn't count, if it doesn't.
fn failure(invocation: &Invocation) -> Option<String> {
    if !invocation.exit.success() {
        Some(format!("exit status {}", invocation.exit))
    } else if invocation.stdout.trim().is_empty() {
        Some("no output".to_string())
    } else {
        None
    }
}
