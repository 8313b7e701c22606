//! Position tracker
//!
//! Each session (account) carries `min_position`: the smallest log position a
//! node must have applied to serve that session's reads. It starts unset and
//! only ever moves forward.

use async_trait::async_trait;

use crate::common::{Lsn, Result};
use crate::store::AccountId;

#[async_trait]
pub trait PositionTracker: Send + Sync {
    /// Current bound, or `None` if the session has never written.
    ///
    /// Fails with `Error::SessionNotFound` for an unknown account.
    async fn required_position(&self, account: AccountId) -> Result<Option<Lsn>>;

    /// Raise the bound to `max(current, position)` and return the stored value.
    ///
    /// Must be a single atomic compare-and-max: two writers racing on the
    /// same session always leave the larger position behind, even when they
    /// run on different service instances.
    async fn advance_required_position(&self, account: AccountId, position: Lsn) -> Result<Lsn>;
}
