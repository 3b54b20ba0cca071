//! Meta-information about devices under test.

use std::{
    fs::OpenOptions,
    io::{self, Seek},
    path::Path,
};

use anyhow::Context as _;

use crate::config::RunConfig;

/// Opens the given device, seeks to the end and returns the number of bytes skipped over.
///
/// The device is opened for writing, so this doubles as a check that we have
/// the privileges every later fio run will need.
pub fn device_capacity(dev_path: &Path) -> anyhow::Result<u64> {
    let mut out = OpenOptions::new()
        .write(true)
        .open(dev_path)
        .with_context(|| format!("Opening the device {:?} for writing", dev_path))?;
    let capacity = out.seek(io::SeekFrom::End(0)).context("Seeking to end")?;
    if capacity == 0 {
        anyhow::bail!("Device {:?} reports a capacity of zero bytes", dev_path);
    }
    Ok(capacity)
}

/// Refuses any region that does not lie entirely within the device.
pub(crate) fn bounds_check(config: &RunConfig, device_capacity: u64) -> anyhow::Result<()> {
    if config.size.bytes() == 0 {
        anyhow::bail!("Run {:?} has an empty test region", config.name);
    }
    match config.region_end() {
        Some(end) if end <= device_capacity => Ok(()),
        _ => anyhow::bail!(
            "Run {:?} would touch {} bytes starting at offset {} of {:?}, but the device only has {} bytes - refusing to overwrite data outside the test region",
            config.name,
            config.size.bytes(),
            config.offset.bytes(),
            config.device,
            device_capacity
        ),
    }
}
