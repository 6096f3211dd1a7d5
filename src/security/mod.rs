//! Process hardening
//!
//! Decrypted validator keys live in this process's memory; a core dump would
//! write them to disk in the clear.

use crate::errors::{KeyManagerError, Result};
use tracing::debug;

/// Set the core file size limit to zero
pub fn disable_core_dumps() -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::resource::{setrlimit, Resource};

        setrlimit(Resource::RLIMIT_CORE, 0, 0)
            .map_err(|e| KeyManagerError::InternalError(format!("setrlimit(RLIMIT_CORE): {}", e)))?;
        debug!("Core dumps disabled");
    }

    Ok(())
}
