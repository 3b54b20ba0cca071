//! The last chance to back out before data gets destroyed.

use std::{
    io::{BufRead, Write},
    path::Path,
};

use crate::config::ByteSize;

/// Asks the operator to type the device path back before anything is written.
pub(crate) fn confirm_destruction(
    device_path: &Path,
    offset: ByteSize,
    size: ByteSize,
    mut input: impl BufRead,
    mut output: impl Write,
) -> anyhow::Result<()> {
    let device = device_path.display().to_string();
    writeln!(
        output,
        "Every run overwrites data on {device}, starting at offset {} and covering at least {}.\n\
         This can not be undone. Type the device path to continue:",
        offset, size,
    )?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    if answer.trim() != device {
        anyhow::bail!(
            "Confirmation did not match {:?}; not touching the device.",
            device_path
        );
    }
    Ok(())
}
