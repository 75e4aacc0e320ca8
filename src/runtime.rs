//! Process role handling
//!
//! A deployment of cooperating processes has exactly one primary, which
//! constructs every shared structure, and any number of secondaries,
//! which attach to what the primary built. The role is normally pinned
//! once at startup, before any map is created; [`ProcessRole::Auto`]
//! resolves the question per heap by attempting exclusive creation of
//! the backing file.

use once_cell::sync::OnceCell;

use crate::error::{Result, ShmapError};

/// The role a process plays towards shared structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Constructs shared structures and owns their teardown
    Primary,
    /// Attaches to structures an existing primary built
    Secondary,
    /// Decide per heap: create if the backing file is absent, attach
    /// otherwise
    Auto,
}

static ROLE: OnceCell<ProcessRole> = OnceCell::new();

/// Pin the process-wide role. May be called at most once; later calls
/// with a different role fail.
pub fn set_process_role(role: ProcessRole) -> Result<()> {
    match ROLE.set(role) {
        Ok(()) => {
            log::debug!("process role pinned to {:?}", role);
            Ok(())
        }
        Err(_) if ROLE.get() == Some(&role) => Ok(()),
        Err(_) => Err(ShmapError::configuration(format!(
            "process role already pinned to {:?}",
            process_role()
        ))),
    }
}

/// The pinned process-wide role, or [`ProcessRole::Auto`] if none was set
pub fn process_role() -> ProcessRole {
    ROLE.get().copied().unwrap_or(ProcessRole::Auto)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The role cell is process-global, so the pinning tests live in one
    // function to stay order-independent under the parallel test runner.
    #[test]
    fn test_role_pinning() {
        assert_eq!(process_role(), ProcessRole::Auto);

        set_process_role(ProcessRole::Auto).unwrap();
        assert_eq!(process_role(), ProcessRole::Auto);

        // Re-pinning the same role is idempotent.
        set_process_role(ProcessRole::Auto).unwrap();

        // A different role is rejected once pinned.
        let err = set_process_role(ProcessRole::Primary).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
