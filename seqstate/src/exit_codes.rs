//! Stable exit codes for seqstate CLI commands.

use crate::error::SeqstateError;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, suite, names, or any other error.
pub const INVALID: i32 = 1;
/// The requested unit's own body failed.
pub const UNIT_FAILED: i32 = 2;
/// A prerequisite failed while being materialized.
pub const PREREQUISITE_FAILED: i32 = 3;
/// An environment could not be wiped.
pub const WIPE_FAILED: i32 = 4;
/// Timed out waiting for an environment lock.
pub const LOCK_TIMEOUT: i32 = 5;

/// Exit code for an error, using the first [`SeqstateError`] in its chain.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SeqstateError>())
        .map_or(INVALID, for_seqstate_error)
}

pub fn for_seqstate_error(err: &SeqstateError) -> i32 {
    match err {
        SeqstateError::UnitFailed { .. } => UNIT_FAILED,
        SeqstateError::PrerequisiteFailed { .. } => PREREQUISITE_FAILED,
        SeqstateError::WipeFailed { .. } => WIPE_FAILED,
        SeqstateError::LockTimeout { .. } => LOCK_TIMEOUT,
        _ => INVALID,
    }
}
