//! Sweep plans: which parameter gets varied, over which values, in which order.

use std::{collections::HashSet, fmt, str::FromStr};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::{ByteSize, OutputFormat, RunConfig, RwMode};
use crate::metadata::bounds_check;

/// A named test volume: a region size written with a given pattern.
///
/// Parsed from `label:size:mode`, e.g. `small_seq:64m:write`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Volume {
    pub label: String,
    pub size: ByteSize,
    pub mode: RwMode,
}

impl FromStr for Volume {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(label), Some(size), Some(mode)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("Volume {s:?} must look like label:size:mode (e.g. small_seq:64m:write)");
        };
        // Labels end up in run names, and run names end up in file names.
        if label.is_empty()
            || label.contains(|c: char| c.is_whitespace() || c == '/' || c == '\\')
            || label.contains("..")
        {
            anyhow::bail!(
                "Volume label {label:?} must be non-empty and contain no whitespace, slashes or \"..\""
            );
        }
        Ok(Self {
            label: label.to_string(),
            size: size.parse()?,
            mode: mode.parse()?,
        })
    }
}

/// One varied parameter and the values it takes, in the order they run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Axis {
    Volume(Vec<Volume>),
    BlockSize(Vec<ByteSize>),
    Jobs(Vec<u32>),
    Mode(Vec<RwMode>),
    QueueDepth(Vec<u32>),
}

impl Axis {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Axis::Volume(_) => "volume",
            Axis::BlockSize(_) => "block-size",
            Axis::Jobs(_) => "jobs",
            Axis::Mode(_) => "mode",
            Axis::QueueDepth(_) => "queue-depth",
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Axis::Volume(v) => v.len(),
            Axis::BlockSize(v) => v.len(),
            Axis::Jobs(v) => v.len(),
            Axis::Mode(v) => v.len(),
            Axis::QueueDepth(v) => v.len(),
        }
    }

    /// The run name for each value, in order.
    pub(crate) fn case_names(&self) -> Vec<String> {
        match self {
            Axis::Volume(volumes) => volumes.iter().map(|v| format!("vol_{}", v.label)).collect(),
            Axis::BlockSize(sizes) => sizes.iter().map(|bs| format!("bs_{bs}")).collect(),
            Axis::Jobs(jobs) => jobs.iter().map(|n| format!("jobs_{n}")).collect(),
            Axis::Mode(modes) => modes.iter().map(|mode| format!("mode_{mode}")).collect(),
            Axis::QueueDepth(depths) => depths.iter().map(|qd| format!("qd_scan_{qd}")).collect(),
        }
    }

    /// Derives one config per axis value from `base`, overriding only the
    /// swept parameter (and the run name).
    fn configs(&self, base: &RunConfig) -> Vec<RunConfig> {
        let overridden: Vec<RunConfig> = match self {
            Axis::Volume(volumes) => volumes
                .iter()
                .map(|v| RunConfig {
                    size: v.size,
                    mode: v.mode,
                    ..base.clone()
                })
                .collect(),
            Axis::BlockSize(sizes) => sizes
                .iter()
                .map(|bs| RunConfig {
                    block_size: *bs,
                    ..base.clone()
                })
                .collect(),
            Axis::Jobs(jobs) => jobs
                .iter()
                .map(|n| RunConfig {
                    jobs: *n,
                    ..base.clone()
                })
                .collect(),
            Axis::Mode(modes) => modes
                .iter()
                .map(|mode| RunConfig {
                    mode: *mode,
                    ..base.clone()
                })
                .collect(),
            Axis::QueueDepth(depths) => depths
                .iter()
                .map(|qd| RunConfig {
                    queue_depth: *qd,
                    ..base.clone()
                })
                .collect(),
        };
        self.case_names()
            .into_iter()
            .zip(overridden)
            .map(|(name, config)| RunConfig { name, ..config })
            .collect()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} values)", self.name(), self.len())
    }
}

/// The queue depths swept when nothing else is asked for.
pub(crate) const DEFAULT_QUEUE_DEPTHS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

/// An ordered list of axes, each swept while everything else stays at the base.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SweepPlan {
    axes: Vec<Axis>,
}

impl SweepPlan {
    /// Appends an axis; axes run in the order they were pushed.
    pub(crate) fn push(&mut self, axis: Axis) -> anyhow::Result<()> {
        if axis.len() == 0 {
            anyhow::bail!("The {} axis has no values to sweep", axis.name());
        }
        if let Axis::Jobs(values) | Axis::QueueDepth(values) = &axis {
            if values.contains(&0) {
                anyhow::bail!("The {} axis can not contain 0", axis.name());
            }
        }
        if let Axis::BlockSize(values) = &axis {
            if values.iter().any(|bs| bs.bytes() == 0) {
                anyhow::bail!("The block-size axis can not contain 0");
            }
        }
        // Run names key the log entries and result files, so they must not repeat.
        let mut seen = HashSet::new();
        let repeated = axis
            .case_names()
            .into_iter()
            .find(|name| !seen.insert(name.clone()));
        if let Some(repeated) = repeated {
            anyhow::bail!(
                "The {} axis would run {repeated} twice; drop the repeated value",
                axis.name()
            );
        }
        self.axes.push(axis);
        Ok(())
    }

    /// Builds a plan from the non-empty axes, keeping their order. With no
    /// values given at all, queue depth gets swept over [`DEFAULT_QUEUE_DEPTHS`].
    pub(crate) fn from_axes(axes: impl IntoIterator<Item = Axis>) -> anyhow::Result<Self> {
        let mut plan = Self::default();
        for axis in axes.into_iter().filter(|axis| axis.len() > 0) {
            plan.push(axis)?;
        }
        if plan.is_empty() {
            info!("No sweep requested; sweeping queue depth");
            plan.push(Axis::QueueDepth(DEFAULT_QUEUE_DEPTHS.to_vec()))?;
        }
        Ok(plan)
    }

    /// The longest region any step writes, so the fill pass can cover it.
    pub(crate) fn largest_region(&self, base: &RunConfig) -> ByteSize {
        self.axes
            .iter()
            .filter_map(|axis| match axis {
                Axis::Volume(volumes) => volumes.iter().map(|v| v.size).max(),
                _ => None,
            })
            .fold(base.size, ByteSize::max)
    }

    pub(crate) fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Expands the plan into the concrete run list for a session.
    ///
    /// Each run gets its own `randseed`, drawn in execution order from a
    /// generator seeded with `seed`, so a session can be replayed exactly.
    pub(crate) fn schedule(
        &self,
        base: &RunConfig,
        prefill: RunConfig,
        seed: u64,
    ) -> Schedule {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let prefill = RunConfig {
            randseed: Some(rng.next_u64()),
            ..prefill
        };
        let steps = self
            .axes
            .iter()
            .flat_map(|axis| {
                axis.configs(base)
                    .into_iter()
                    .map(move |config| (axis.name(), config))
            })
            .map(|(axis, config)| Step {
                axis,
                config: RunConfig {
                    randseed: Some(rng.next_u64()),
                    ..config
                },
            })
            .collect();
        Schedule { prefill, steps }
    }
}

/// A single measurement run and the axis it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub axis: &'static str,
    pub config: RunConfig,
}

/// Every run of a session, in execution order. The fill pass always comes first.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Schedule {
    pub prefill: RunConfig,
    pub steps: Vec<Step>,
}

impl Schedule {
    /// Bounds-checks every run before anything touches the device.
    pub(crate) fn validate(&self, device_capacity: u64) -> anyhow::Result<()> {
        for config in self.configs() {
            bounds_check(config, device_capacity)?;
        }
        Ok(())
    }

    pub(crate) fn configs(&self) -> impl Iterator<Item = &RunConfig> {
        std::iter::once(&self.prefill).chain(self.steps.iter().map(|step| &step.config))
    }
}

/// The fill pass that brings the test region into a repeatable state.
///
/// A sequential write over the whole region, no time bound, always in
/// fio's normal output format.
pub(crate) fn prefill_config(
    base: &RunConfig,
    block_size: ByteSize,
    queue_depth: u32,
    loops: u32,
) -> RunConfig {
    RunConfig {
        name: "pre_fill".to_string(),
        block_size,
        mode: RwMode::Write,
        rwmix_read: None,
        queue_depth,
        jobs: 1,
        runtime: None,
        output_format: OutputFormat::Normal,
        extra: vec![format!("--loops={loops}")],
        ..base.clone()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::{path::PathBuf, time::Duration};
    use tracing_test::traced_test;

    pub(crate) fn prefill() -> RunConfig {
        prefill_config(&base(), ByteSize::kib(128), 32, 1)
    }

    pub(crate) fn base() -> RunConfig {
        RunConfig {
            name: "base".to_string(),
            device: PathBuf::from("/dev/test"),
            offset: ByteSize::gib(1),
            size: ByteSize::gib(1),
            block_size: ByteSize::kib(4),
            mode: RwMode::RandRead,
            rwmix_read: None,
            queue_depth: 1,
            jobs: 1,
            runtime: Some(Duration::from_secs(3)),
            ioengine: "libaio".to_string(),
            output_format: OutputFormat::Normal,
            randseed: None,
            extra: vec![],
        }
    }

    #[test]
    fn queue_depth_sweep_differs_only_in_queue_depth() {
        let mut plan = SweepPlan::default();
        plan.push(Axis::QueueDepth(vec![1, 2, 4, 8])).unwrap();
        let schedule = plan.schedule(&base(), prefill(), 7);

        assert_eq!(schedule.steps.len(), 4);
        let depths: Vec<u32> = schedule.steps.iter().map(|s| s.config.queue_depth).collect();
        assert_eq!(depths, vec![1, 2, 4, 8]);
        for step in &schedule.steps {
            assert_eq!(step.axis, "queue-depth");
            let normalized = RunConfig {
                name: "base".to_string(),
                queue_depth: 1,
                randseed: None,
                ..step.config.clone()
            };
            assert_eq!(normalized, base());
        }
        assert_eq!(schedule.steps[2].config.name, "qd_scan_4");
    }

    #[test]
    fn axes_run_in_declared_order() {
        let mut plan = SweepPlan::default();
        plan.push(Axis::BlockSize(vec![ByteSize::kib(64), ByteSize::kib(4)]))
            .unwrap();
        plan.push(Axis::Mode(vec![RwMode::Write, RwMode::RandRw])).unwrap();
        plan.push(Axis::Jobs(vec![2])).unwrap();
        let names: Vec<String> = plan
            .schedule(&base(), prefill(), 0)
            .steps
            .into_iter()
            .map(|s| s.config.name)
            .collect();
        assert_eq!(names, vec!["bs_64k", "bs_4k", "mode_write", "mode_randrw", "jobs_2"]);
    }

    #[test]
    fn seeds_are_reproducible() {
        let mut plan = SweepPlan::default();
        plan.push(Axis::QueueDepth(vec![1, 2])).unwrap();
        let a = plan.schedule(&base(), prefill(), 42);
        let b = plan.schedule(&base(), prefill(), 42);
        assert_eq!(a, b);
        assert_ne!(a.steps[0].config.randseed, a.steps[1].config.randseed);
        assert!(a.prefill.randseed.is_some());
        assert_eq!(a.configs().next().map(|c| c.name.as_str()), Some("pre_fill"));
    }

    #[traced_test]
    #[test]
    fn falls_back_to_a_queue_depth_sweep() {
        let plan = SweepPlan::from_axes([Axis::BlockSize(vec![]), Axis::Jobs(vec![])]).unwrap();
        assert_eq!(plan.axes(), &[Axis::QueueDepth(DEFAULT_QUEUE_DEPTHS.to_vec())]);
        assert!(logs_contain("sweeping queue depth"));
    }

    #[test]
    fn keeps_only_requested_axes() {
        let plan = SweepPlan::from_axes([
            Axis::Volume(vec![]),
            Axis::Jobs(vec![1, 2]),
            Axis::QueueDepth(vec![4]),
        ])
        .unwrap();
        let names: Vec<_> = plan.axes().iter().map(Axis::name).collect();
        assert_eq!(names, vec!["jobs", "queue-depth"]);
        assert!(SweepPlan::from_axes([Axis::Jobs(vec![0])]).is_err());
    }

    #[test]
    fn rejects_empty_and_zero_axes() {
        let mut plan = SweepPlan::default();
        assert!(plan.push(Axis::QueueDepth(vec![])).is_err());
        assert!(plan.push(Axis::Jobs(vec![1, 0])).is_err());
        assert!(plan.push(Axis::BlockSize(vec![ByteSize(0)])).is_err());
        assert!(plan.is_empty());
    }

    #[test]
    fn rejects_values_that_would_repeat_a_run_name() {
        let mut plan = SweepPlan::default();
        let err = plan
            .push(Axis::BlockSize(vec![ByteSize::kib(4), ByteSize(4096)]))
            .expect_err("4k and 4096 are the same block size");
        assert!(err.to_string().contains("bs_4k"));
        assert!(plan.push(Axis::QueueDepth(vec![4, 4])).is_err());
        assert!(plan
            .push(Axis::Volume(vec![
                "a:64m:write".parse().unwrap(),
                "a:1g:randwrite".parse().unwrap(),
            ]))
            .is_err());
        assert!(plan.is_empty());
        plan.push(Axis::QueueDepth(vec![4, 8])).unwrap();
        assert_eq!(plan.axes()[0].case_names(), vec!["qd_scan_4", "qd_scan_8"]);
    }

    #[test]
    fn validation_catches_oversized_volumes() {
        let mut plan = SweepPlan::default();
        plan.push(Axis::Volume(vec![
            "small_seq:64m:write".parse().unwrap(),
            "huge_rand:4g:randwrite".parse().unwrap(),
        ]))
        .unwrap();
        assert_eq!(plan.largest_region(&base()), ByteSize::gib(4));
        let schedule = plan.schedule(&base(), prefill(), 0);
        assert_eq!(schedule.steps[0].config.name, "vol_small_seq");
        assert_eq!(schedule.steps[1].config.mode, RwMode::RandWrite);
        let capacity = ByteSize::gib(3).bytes();
        let err = schedule.validate(capacity).expect_err("4g at 1g offset exceeds 3g");
        assert!(err.to_string().contains("vol_huge_rand"));
    }

    #[test]
    fn prefill_is_a_sequential_write_over_the_region() {
        let prefill = prefill_config(&base(), ByteSize::kib(128), 32, 2);
        assert_eq!(prefill.mode, RwMode::Write);
        assert_eq!(prefill.offset, base().offset);
        assert_eq!(prefill.size, base().size);
        assert_eq!(prefill.runtime, None);
        assert_eq!(prefill.extra, vec!["--loops=2".to_string()]);
    }

    #[test]
    fn parses_volumes() {
        let volume: Volume = "large_rand:1g:randwrite".parse().unwrap();
        assert_eq!(volume.size, ByteSize::gib(1));
        assert!("large_rand:1g".parse::<Volume>().is_err());
        assert!(":1g:write".parse::<Volume>().is_err());
        assert!("x:1g:sideways".parse::<Volume>().is_err());
        assert!("a/b:64m:write".parse::<Volume>().is_err());
        assert!("..:64m:write".parse::<Volume>().is_err());
        assert!("up..there:64m:write".parse::<Volume>().is_err());
    }
}
