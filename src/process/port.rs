//! Listen port selection.

use std::net::TcpListener;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Returns `port` if it can be bound on `address`, otherwise a free port.
///
/// The probe socket is closed before returning, so the tool can bind the
/// port itself right after.
///
/// # Errors
/// `Config` if no port at all can be bound on `address`.
pub fn resolve_port(address: &str, port: u16) -> Result<u16> {
    if port != 0 && TcpListener::bind((address, port)).is_ok() {
        debug!("[PROCESS] Port {}:{} is free", address, port);
        return Ok(port);
    }

    let listener = TcpListener::bind((address, 0))
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", address, e)))?;
    let free = listener
        .local_addr()
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", address, e)))?
        .port();

    if port != 0 {
        warn!(
            "[PROCESS] Port {} on {} is in use, using {} instead",
            port, address, free
        );
    }
    Ok(free)
}
