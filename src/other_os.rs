use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use tracing::warn;

use crate::RunArgs;

/// No probing available here; only the path is known.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceMetadata;

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub partition: Option<u64>,
    pub device: DeviceMetadata,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            path: PathBuf::from(s),
            partition: None,
            device: DeviceMetadata,
        })
    }
}

pub(crate) fn sanity_checks(
    args: &RunArgs,
    _partition: Option<u64>,
    device_path: &Path,
    _device: &DeviceMetadata,
) -> anyhow::Result<()> {
    if !args.i_know_what_im_doing_let_me_skip_sanity_checks {
        anyhow::bail!("Can't tell on this platform whether {:?} is a whole disk or has mounted filesystems. Pass --i-know-what-im-doing-let-me-skip-sanity-checks to sweep it (and overwrite the test region) anyway.", device_path);
    }
    warn!(?device_path, "Skipping partition and mount checks");
    Ok(())
}
