//! Identifiers, well-known names and small helpers shared by the registry components.

use log::debug;

use crate::core::error::Result;

pub type JobId = u64;
pub type ServiceId = u64;

/// Service type of the workflow service.
pub const TYPE_WORKFLOW: &str = "org.opencastproject.workflow";

/// Workflow bookkeeping operations which are kept by the parentless job cleanup.
pub const START_WORKFLOW: &str = "START_WORKFLOW";
pub const START_OPERATION: &str = "START_OPERATION";
pub const RESUME: &str = "RESUME";

/// Path suffix of the worker endpoint accepting dispatched jobs.
pub const DISPATCH_ENDPOINT: &str = "dispatch";

/// How many times a read-modify-write cycle is repeated after losing a version check.
pub const MAX_UPDATE_ATTEMPTS: usize = 10;

/// Joins URL parts making sure there is exactly one slash between them.
pub fn concat_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !path.is_empty() => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Runs a read-modify-write operation again while it fails with a version conflict.
///
/// The operation is expected to reload the entity it modifies on every call.
pub fn retry_on_conflict<T, F>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_conflict() && attempt < MAX_UPDATE_ATTEMPTS => {
                debug!("conflict while updating {}, retrying (attempt {})", what, attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}
