use std::io::Write;

use crate::frame::ProcessedFrame;

/// Writes the converted frame's bytes to `out` and returns how many were
/// written. Device memory is copied to the host first.
pub fn dump_frame<W: Write>(frame: &ProcessedFrame, out: &mut W) -> anyhow::Result<usize> {
    let bytes = frame.surface().copy_to_host()?;
    out.write_all(&bytes)?;
    log::trace!("dump: wrote {} bytes of {}", bytes.len(), frame);
    Ok(bytes.len())
}
