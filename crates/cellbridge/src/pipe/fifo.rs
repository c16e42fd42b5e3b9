//! Named pipe files.
//!
//! Path format: `{dir}/{prefix}{uuid}`, created with mode 0600.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

/// Prefix of the FIFOs created for a child process.
pub const FIFO_PREFIX: &str = "gonb_pipe_";

/// Creates a uniquely named FIFO under `dir`.
pub fn create_fifo(dir: &Path, prefix: &str) -> io::Result<PathBuf> {
    let path = dir.join(format!("{}{}", prefix, uuid::Uuid::new_v4().simple()));
    mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
    tracing::trace!(path = %path.display(), "Created fifo");
    Ok(path)
}

/// Removes a FIFO. An already-absent path is not an error.
pub fn remove_fifo(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::trace!(path = %path.display(), "Removed fifo");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
