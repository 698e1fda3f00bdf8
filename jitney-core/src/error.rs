use jitney_pricing::PolicyError;
use uuid::Uuid;

/// Why a resolve/accept/cancel call lost its race or failed its guard.
/// Reported to the caller distinctly from success: the driver UI must know
/// its accept did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The ride is not (or no longer) offered to this driver.
    NotOfferedToDriver,
    /// The offer's acceptance window has closed.
    OfferExpired,
    /// Another driver already won the ride.
    AlreadyAssigned,
    /// The ride reached a terminal state (completed/cancelled/unmatched).
    AlreadyTerminal,
    /// The trip has started; cancellation is no longer possible.
    NotCancellable,
    /// The caller is not the driver assigned to this ride.
    NotAssignedDriver,
    /// The ride's state advanced concurrently and the operation no longer
    /// applies.
    Superseded,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ConflictReason::NotOfferedToDriver => "ride no longer offered to you",
            ConflictReason::OfferExpired => "offer expired",
            ConflictReason::AlreadyAssigned => "ride already accepted by another driver",
            ConflictReason::AlreadyTerminal => "ride already terminated",
            ConflictReason::NotCancellable => "ride already started",
            ConflictReason::NotAssignedDriver => "ride not assigned to you",
            ConflictReason::Superseded => "ride state changed concurrently",
        };
        f.write_str(msg)
    }
}

/// Persistence failures. Failures during the critical-section conditional
/// update fail closed: no state change may be assumed by the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Ride not found: {0}")]
    RideNotFound(Uuid),

    #[error("Offer not found: {0}")]
    OfferNotFound(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Driver directory failures; the directory is a read-only collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Driver directory unavailable: {0}")]
    Unavailable(String),
}

/// Engine error taxonomy. Everything crosses component boundaries as a typed
/// `Result`; retries on transient collaborator failures are the caller's
/// responsibility. Exhaustion is not represented here: a ride running out of
/// candidates is the normal `Unmatched` terminal outcome.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict on ride {ride_id}: {reason}")]
    Conflict { ride_id: Uuid, reason: ConflictReason },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl DispatchError {
    pub fn conflict(ride_id: Uuid, reason: ConflictReason) -> Self {
        DispatchError::Conflict { ride_id, reason }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Conflict { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
