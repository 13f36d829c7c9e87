//! Physical memory detection for the allocation pre-flight

use crate::error::ResourceError;
use humansize::{format_size, BINARY};
use tracing::{debug, warn};

/// Total physical memory in bytes, if the platform reports it
pub fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions and only reads system constants.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some(pages as u64 * page_size as u64)
}

/// Fail if holding `requested` bytes of results could exhaust memory
///
/// Twice the requested size must fit, since results may briefly exist both
/// in worker buffers and in the aggregated output.
pub fn preflight(requested: u64, available: Option<u64>) -> Result<(), ResourceError> {
    let Some(available) = available else {
        warn!(
            requested = %format_size(requested, BINARY),
            "Could not detect physical memory; skipping memory check"
        );
        return Ok(());
    };
    debug!(
        requested = %format_size(requested, BINARY),
        available = %format_size(available, BINARY),
        "Memory pre-flight"
    );
    if requested.saturating_mul(2) > available {
        return Err(ResourceError::InsufficientMemory {
            requested: format_size(requested, BINARY),
            available: format_size(available, BINARY),
        });
    }
    Ok(())
}
