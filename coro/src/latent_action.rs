//! Per-frame latent action manager contract.
//!
//! The runtime does not own a frame clock or an object model. A host that
//! supports latent coroutines exposes both through [`LatentActionManager`]:
//! actions are registered under an `(owner, uuid)` key, ticked once per
//! frame on the game thread, and dropped when they finish, when their owner
//! dies, or when the host forcibly removes them.

use std::fmt;

/// Identifier of a host object that can own latent actions.
///
/// Owners are opaque to the runtime; only the host knows whether one is
/// still alive ([`LatentActionManager::is_valid`]).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Wraps a raw host object id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw host object id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Key of a latent action: its owner and a per-owner unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatentInfo {
    pub owner: ObjectId,
    pub uuid: i32,
}

impl LatentInfo {
    pub fn new(owner: ObjectId, uuid: i32) -> Self {
        Self { owner, uuid }
    }
}

/// Result of ticking a pending latent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentResponse {
    /// Keep the action and tick it again next frame.
    KeepWaiting,
    /// Remove the action and fire the owner's continuation.
    FinishedFireContinuation,
    /// Remove the action silently.
    FinishedNoContinuation,
}

impl LatentResponse {
    /// Whether the action should be removed.
    pub fn is_finished(self) -> bool {
        !matches!(self, LatentResponse::KeepWaiting)
    }
}

/// An action ticked by a [`LatentActionManager`].
///
/// Every method is called on the game thread. Dropping the action is how
/// the manager tells it that it is gone for good; the drop also happens on
/// the game thread.
pub trait PendingLatentAction: Send {
    /// Called once per frame.
    fn update(&mut self, manager: &dyn LatentActionManager) -> LatentResponse;

    /// The manager removed this action before it finished.
    fn notify_aborted(&mut self) {}

    /// The owner of this action was destroyed.
    fn notify_owner_destroyed(&mut self) {}
}

/// Host-side scheduler of latent actions.
///
/// `add_action` and `find_action` are only called on the game thread.
/// The remaining queries may be called from any thread.
pub trait LatentActionManager: Send + Sync {
    /// Whether an action with this key is registered.
    fn find_action(&self, info: LatentInfo) -> bool;

    /// Registers a new action. It is ticked starting with the next frame.
    fn add_action(&self, info: LatentInfo, action: Box<dyn PendingLatentAction>);

    /// Whether `owner` is still alive.
    fn is_valid(&self, owner: ObjectId) -> bool;

    /// Allocates an id that is unique for the lifetime of the manager.
    fn next_uuid(&self) -> i32;

    /// An owner that lives as long as the manager, used for anonymous actions.
    fn system_owner(&self) -> ObjectId;

    /// Number of frames ticked so far.
    fn frame_counter(&self) -> u64;

    /// World time in seconds.
    fn time_seconds(&self) -> f64;
}
