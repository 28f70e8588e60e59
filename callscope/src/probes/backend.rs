use std::sync::Arc;

use super::ProbeSite;
use crate::domain::{AttachError, Pid};
use crate::events::Notice;
use crate::symbolization::Location;

/// The mechanism that actually plants traps in a target
///
/// The probe manager decides *what* is attached and keeps the bookkeeping;
/// a backend only installs and removes traps and carries notices into the
/// event stream.
pub trait ProbeBackend: Send {
    /// Whether `pid` is still running and can be instrumented
    fn target_alive(&self, pid: Pid) -> bool;

    /// Install a trap for `site` at `location`
    ///
    /// # Errors
    /// `PermissionDenied` if the target cannot be instrumented, `ProcessGone`
    /// if it exited underneath us, `SlotsExhausted` or `Backend` otherwise.
    fn install(&mut self, site: &Arc<ProbeSite>, location: &Location) -> Result<(), AttachError>;

    /// Remove the trap for `site`; no new firing can start after this returns
    ///
    /// # Errors
    /// Returns an error if the trap could not be removed cleanly
    fn remove(&mut self, site: &ProbeSite) -> Result<(), AttachError>;

    /// Put a notice into the event stream, ordered after every event already
    /// produced by the traps this backend owns
    fn publish(&self, notice: Notice);
}
