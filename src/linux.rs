extern crate block_utils;
use crate::RunArgs;
use anyhow::Context as _;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub partition: Option<u64>,
    pub device: block_utils::Device,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (partition, device) = block_utils::get_device_from_path(s)?;
        Ok(Self {
            path: PathBuf::from(s),
            partition,
            device: device.ok_or(anyhow::anyhow!(
                "{s:?} is not a block device, so there is nothing for fio to sweep."
            ))?,
        })
    }
}

pub(crate) fn sanity_checks(
    args: &RunArgs,
    partition: Option<u64>,
    device_path: &Path,
    device: &block_utils::Device,
) -> anyhow::Result<()> {
    if let Some(number) = partition {
        if !args.allow_any_block_device {
            anyhow::bail!("{device_path:?} is partition {number} of a larger disk - pass --allow-any-block-device to sweep just that partition.");
        } else {
            warn!(
                ?partition,
                ?device_path,
                "Sweeping a single partition; numbers may differ from the whole device."
            );
        }
    }

    // mtab names the kernel node, so symlinks like /dev/disk/by-id/... need resolving.
    let node = fs::canonicalize(device_path)
        .with_context(|| format!("Resolving {:?}", device_path))?;
    let mut nodes = vec![node.clone()];
    nodes.extend(block_utils::get_children_devpaths_from_path(&node)?);
    if let Some((mounted, mountpoint)) =
        first_mounted(nodes, |node| Ok(block_utils::get_mountpoint(node)?))?
    {
        anyhow::bail!(
            "{:?} is mounted at {:?} - unmount it before sweeping {:?}, fio would overwrite the filesystem.",
            mounted,
            mountpoint,
            device_path
        );
    }
    info!(
        ?device.media_type,
        ?device.device_type,
        serial = ?device.serial_number,
        "Device under test"
    );
    Ok(())
}

/// The first of `nodes` that is mounted somewhere, and where.
fn first_mounted(
    nodes: impl IntoIterator<Item = PathBuf>,
    mountpoint_of: impl Fn(&Path) -> anyhow::Result<Option<PathBuf>>,
) -> anyhow::Result<Option<(PathBuf, PathBuf)>> {
    for node in nodes {
        if let Some(mountpoint) = mountpoint_of(&node)? {
            return Ok(Some((node, mountpoint)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;

    fn disk() -> Vec<PathBuf> {
        ["/dev/sdz", "/dev/sdz1", "/dev/sdz2"]
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    #[test]
    fn finds_a_mounted_partition_of_the_disk() {
        let found = first_mounted(disk(), |node| {
            Ok((node == Path::new("/dev/sdz2")).then(|| PathBuf::from("/boot")))
        })
        .unwrap();
        assert_eq!(
            found,
            Some((PathBuf::from("/dev/sdz2"), PathBuf::from("/boot")))
        );
    }

    #[test]
    fn unmounted_disks_pass() {
        assert_eq!(first_mounted(disk(), |_| Ok(None)).unwrap(), None);
    }
}
