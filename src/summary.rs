//! Reading results back out of a finished session.
//!
//! The sweep itself never looks at fio's output; this is an after-the-fact
//! view over the session log (fio's normal report) or the per-run JSON
//! artifacts. Fill passes and runs that reported errors are skipped.

use std::{collections::BTreeMap, fmt, fs, path::Path};

use anyhow::Context as _;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

const REGEX_SYNTAX: &str = "Internal error in fio report regex syntax";

lazy_static! {
    static ref RUN_HEADER: Regex = Regex::new(r"--- Running:\s+(\S+)\s+\((.*?)\)\s+---").expect(REGEX_SYNTAX);
    static ref HEADER_FIELD: Regex = Regex::new(r"(RW|BS|Jobs|QD|Size|Time)=([^,)]*)").expect(REGEX_SYNTAX);
    static ref JOB_ERROR: Regex = Regex::new(r": \(groupid=.*?\): err=\s*(\d+)").expect(REGEX_SYNTAX);
    static ref FINISHED: Regex = Regex::new(r"--- Finished: \S+ status=(\S+)").expect(REGEX_SYNTAX);
    static ref OPERATION: Regex = Regex::new(
        r"(?m)^\s*(read|write|trim):\s+IOPS=([\d.]+)([kM]?),\s+BW=([\d.]+)(KiB/s|MiB/s|GiB/s|B/s)"
    )
    .expect(REGEX_SYNTAX);
    static ref CLAT: Regex = Regex::new(r"(?s)\bclat \(([^)]+)\):.*?avg=\s*([\d.]+)([kmun]?)").expect(REGEX_SYNTAX);
}

/// Measured numbers for one direction of one run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OpSummary {
    pub op: String,
    pub iops: f64,
    pub bw_mib: f64,
    /// Mean completion latency in microseconds.
    pub clat_avg_us: Option<f64>,
}

/// One successful measurement run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CaseSummary {
    pub name: String,
    pub group: &'static str,
    pub params: BTreeMap<String, String>,
    pub ops: Vec<OpSummary>,
}

/// The parsed view of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SessionSummary {
    pub cases: Vec<CaseSummary>,
    /// Runs that failed and were left out.
    pub skipped: Vec<String>,
}

/// Which sweep axis a run name came from.
pub(crate) fn group_of(name: &str) -> &'static str {
    [
        ("vol_", "volume"),
        ("bs_", "block-size"),
        ("jobs_", "jobs"),
        ("mode_", "mode"),
        ("qd_scan_", "queue-depth"),
    ]
    .iter()
    .find(|(prefix, _)| name.starts_with(prefix))
    .map(|(_, group)| *group)
    .unwrap_or("other")
}

/// Summarizes a session log file, or a directory of JSON artifacts.
pub(crate) fn summarize(path: &Path) -> anyhow::Result<SessionSummary> {
    if path.is_dir() {
        let mut artifacts = fs::read_dir(path)
            .with_context(|| format!("Listing {:?}", path))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        artifacts.retain(|p| p.extension().is_some_and(|ext| ext == "json"));
        artifacts.sort();
        let mut summary = SessionSummary::default();
        for artifact in artifacts {
            let text = fs::read_to_string(&artifact)
                .with_context(|| format!("Reading {:?}", artifact))?;
            match parse_json(&text).with_context(|| format!("Parsing {:?}", artifact))? {
                Some(case) => summary.cases.push(case),
                None => summary.skipped.push(artifact.display().to_string()),
            }
        }
        Ok(summary)
    } else {
        let text = fs::read_to_string(path).with_context(|| format!("Reading {:?}", path))?;
        Ok(parse_log(&text))
    }
}

/// Splits a session log on run headers and parses each run's section.
pub(crate) fn parse_log(content: &str) -> SessionSummary {
    let headers: Vec<_> = RUN_HEADER.captures_iter(content).collect();
    let mut summary = SessionSummary::default();
    for (index, header) in headers.iter().enumerate() {
        let Some(whole) = header.get(0) else { continue };
        let name = &header[1];
        let end = headers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(content.len());
        let section = &content[whole.start()..end];
        if name == "pre_fill" {
            continue;
        }
        if run_failed(section) {
            warn!(case = name, "Skipping failed run");
            summary.skipped.push(name.to_string());
            continue;
        }
        let ops = parse_ops(section);
        if ops.is_empty() {
            debug!(case = name, "No fio report in this run; JSON results live in the artifact directory");
            continue;
        }
        let params = HEADER_FIELD
            .captures_iter(&header[2])
            .map(|c| (c[1].to_string(), c[2].trim().to_string()))
            .collect();
        summary.cases.push(CaseSummary {
            name: name.to_string(),
            group: group_of(name),
            params,
            ops,
        });
    }
    summary
}

fn run_failed(section: &str) -> bool {
    let job_error = JOB_ERROR
        .captures_iter(section)
        .any(|c| c[1].parse::<u64>().map_or(true, |err| err != 0));
    let exit_error = FINISHED
        .captures(section)
        .is_some_and(|c| &c[1] != "0");
    job_error || exit_error || section.contains("Input/output error")
}

fn parse_ops(section: &str) -> Vec<OpSummary> {
    let matches: Vec<_> = OPERATION.captures_iter(section).collect();
    let status_line = section.find("Run status group").unwrap_or(section.len());
    matches
        .iter()
        .enumerate()
        .filter_map(|(index, op)| {
            let whole = op.get(0)?;
            let block_end = matches
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(status_line)
                .max(whole.end());
            let block = &section[whole.start()..block_end];
            let iops = op[2].parse::<f64>().ok()? * scale_count(&op[3]);
            let bw_mib = to_mib(op[4].parse().ok()?, &op[5])?;
            let clat_avg_us = CLAT.captures(block).and_then(|c| {
                let value: f64 = c[2].parse().ok()?;
                Some(to_usec(&c[1], value, &c[3]))
            });
            Some(OpSummary {
                op: op[1].to_string(),
                iops,
                bw_mib,
                clat_avg_us,
            })
        })
        .collect()
}

fn scale_count(suffix: &str) -> f64 {
    match suffix {
        "k" => 1e3,
        "M" => 1e6,
        _ => 1.0,
    }
}

fn to_mib(value: f64, unit: &str) -> Option<f64> {
    match unit {
        "B/s" => Some(value / (1024.0 * 1024.0)),
        "KiB/s" => Some(value / 1024.0),
        "MiB/s" => Some(value),
        "GiB/s" => Some(value * 1024.0),
        _ => None,
    }
}

/// Converts a latency printed in `unit` (nsec, usec, msec, sec), with fio's
/// optional k/m suffix, to microseconds.
fn to_usec(unit: &str, value: f64, suffix: &str) -> f64 {
    let value = match suffix {
        "k" => value * 1e3,
        "m" => value * 1e6,
        _ => value,
    };
    match unit {
        "nsec" => value / 1e3,
        "msec" => value * 1e3,
        "sec" => value * 1e6,
        _ => value,
    }
}

#[derive(Debug, Deserialize)]
struct FioJson {
    jobs: Vec<FioJob>,
}

#[derive(Debug, Deserialize)]
struct FioJob {
    jobname: String,
    #[serde(default)]
    error: i64,
    #[serde(rename = "job options", default)]
    options: BTreeMap<String, String>,
    read: Option<FioOp>,
    write: Option<FioOp>,
    trim: Option<FioOp>,
}

#[derive(Debug, Deserialize)]
struct FioOp {
    io_bytes: u64,
    iops: f64,
    /// KiB/s.
    bw: f64,
    clat_ns: Option<FioLatency>,
}

#[derive(Debug, Deserialize)]
struct FioLatency {
    mean: f64,
}

/// Parses one run's `--output-format=json` output. `None` means fio reported
/// an error for the run.
pub(crate) fn parse_json(text: &str) -> anyhow::Result<Option<CaseSummary>> {
    // fio sometimes prints notes before the JSON document.
    let start = text.find('{').context("No JSON object in fio output")?;
    let report: FioJson = serde_json::from_str(&text[start..])?;
    let job = report.jobs.into_iter().next().context("fio reported no jobs")?;
    if job.error != 0 {
        return Ok(None);
    }
    let ops = [("read", job.read), ("write", job.write), ("trim", job.trim)]
        .into_iter()
        .filter_map(|(name, op)| op.filter(|op| op.io_bytes > 0).map(|op| (name, op)))
        .map(|(name, op)| OpSummary {
            op: name.to_string(),
            iops: op.iops,
            bw_mib: op.bw / 1024.0,
            clat_avg_us: op.clat_ns.map(|lat| lat.mean / 1e3),
        })
        .collect();
    let params = [("rw", "RW"), ("bs", "BS"), ("numjobs", "Jobs"), ("iodepth", "QD"), ("size", "Size"), ("runtime", "Time")]
        .into_iter()
        .filter_map(|(option, key)| job.options.get(option).map(|v| (key.to_string(), v.clone())))
        .collect();
    Ok(Some(CaseSummary {
        group: group_of(&job.jobname),
        name: job.jobname,
        params,
        ops,
    }))
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<24} {:<12} {:<10} {:>6} {:>5} {:<6} {:>12} {:>12} {:>14}",
            "case", "group", "rw", "jobs", "qd", "op", "IOPS", "BW (MiB/s)", "clat avg (us)"
        )?;
        for case in &self.cases {
            let param = |key: &str| case.params.get(key).map(String::as_str).unwrap_or("-");
            for op in &case.ops {
                let clat = op
                    .clat_avg_us
                    .map(|us| format!("{us:.2}"))
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    f,
                    "{:<24} {:<12} {:<10} {:>6} {:>5} {:<6} {:>12.0} {:>12.2} {:>14}",
                    case.name,
                    case.group,
                    param("RW"),
                    param("Jobs"),
                    param("QD"),
                    op.op,
                    op.iops,
                    op.bw_mib,
                    clat
                )?;
            }
        }
        if !self.skipped.is_empty() {
            writeln!(f, "skipped (failed): {}", self.skipped.join(", "))?;
        }
        Ok(())
    }
}
