//! Transition tables for share objects and share items.
//!
//! Transitions are pure functions of `(status, action)`. The storage layer
//! applies them with compare-and-set updates, so a status read here is only a
//! precondition and the write re-checks it.

use crate::status::{ShareItemStatus, ShareObjectStatus};
use crate::{Result, ShareError};
use serde::{Deserialize, Serialize};

/// Actions that move a share object between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareObjectAction {
    Submit,
    Approve,
    Reject,
    /// Begin the pending grant or revoke batch
    Start,
    /// Grant or revoke batch completed, whatever the per-item outcome
    Finish,
    RevokeItems,
    AddItem,
    RemoveItem,
    Delete,
}

impl ShareObjectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareObjectAction::Submit => "submit",
            ShareObjectAction::Approve => "approve",
            ShareObjectAction::Reject => "reject",
            ShareObjectAction::Start => "start",
            ShareObjectAction::Finish => "finish",
            ShareObjectAction::RevokeItems => "revoke_items",
            ShareObjectAction::AddItem => "add_item",
            ShareObjectAction::RemoveItem => "remove_item",
            ShareObjectAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ShareObjectAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions that move a share item between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareItemAction {
    Approve,
    Reject,
    Start,
    Success,
    Failure,
    RevokeItems,
}

impl ShareItemAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareItemAction::Approve => "approve",
            ShareItemAction::Reject => "reject",
            ShareItemAction::Start => "start",
            ShareItemAction::Success => "success",
            ShareItemAction::Failure => "failure",
            ShareItemAction::RevokeItems => "revoke_items",
        }
    }
}

impl std::fmt::Display for ShareItemAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ShareObjectStatus {
    /// Compute the status reached by applying `action`.
    pub fn transition(self, action: ShareObjectAction) -> Result<ShareObjectStatus> {
        use ShareObjectAction as A;
        use ShareObjectStatus as S;

        let next = match (self, action) {
            (S::Draft | S::Submitted, A::Submit) => S::Submitted,
            (S::Submitted, A::Approve) => S::Approved,
            (S::Submitted, A::Reject) => S::Rejected,
            (S::Approved, A::Start) => S::ShareInProgress,
            (S::Revoked, A::Start) => S::RevokeInProgress,
            (S::ShareInProgress | S::RevokeInProgress, A::Finish) => S::Processed,
            (S::Processed | S::Revoked, A::RevokeItems) => S::Revoked,
            (S::Draft | S::Submitted, A::AddItem) => S::Draft,
            (S::Draft, A::RemoveItem) => S::Draft,
            (S::Submitted, A::RemoveItem) => S::Submitted,
            (S::Draft | S::Submitted | S::Rejected | S::Processed, A::Delete) => S::Deleted,
            (from, action) => {
                return Err(ShareError::InvalidTransition {
                    entity: "share object".to_string(),
                    from: from.to_string(),
                    action: action.to_string(),
                })
            }
        };
        Ok(next)
    }

    /// Item statuses that may coexist with this object status.
    pub fn allowed_item_statuses(&self) -> &'static [ShareItemStatus] {
        use ShareItemStatus as I;

        match self {
            ShareObjectStatus::Draft | ShareObjectStatus::Submitted => &[I::PendingApproval],
            ShareObjectStatus::Approved => &[I::ShareApproved],
            ShareObjectStatus::Rejected => &[I::ShareRejected],
            ShareObjectStatus::ShareInProgress => &[
                I::ShareApproved,
                I::ShareInProgress,
                I::ShareSucceeded,
                I::ShareFailed,
            ],
            ShareObjectStatus::Processed => &[
                I::ShareSucceeded,
                I::ShareFailed,
                I::RevokeSucceeded,
                I::RevokeFailed,
            ],
            ShareObjectStatus::Revoked => &[
                I::ShareSucceeded,
                I::ShareFailed,
                I::RevokeApproved,
                I::RevokeSucceeded,
                I::RevokeFailed,
            ],
            ShareObjectStatus::RevokeInProgress => &[
                I::ShareSucceeded,
                I::ShareFailed,
                I::RevokeApproved,
                I::RevokeInProgress,
                I::RevokeSucceeded,
                I::RevokeFailed,
            ],
            ShareObjectStatus::Deleted => &[],
        }
    }

    pub fn admits_item_status(&self, item: ShareItemStatus) -> bool {
        self.allowed_item_statuses().contains(&item)
    }
}

impl ShareItemStatus {
    /// Compute the status reached by applying `action`.
    ///
    /// `Success` and `Failure` are accepted from the failed statuses so that
    /// reapply can retry an item in place.
    pub fn transition(self, action: ShareItemAction) -> Result<ShareItemStatus> {
        use ShareItemAction as A;
        use ShareItemStatus as S;

        let next = match (self, action) {
            (S::PendingApproval, A::Approve) => S::ShareApproved,
            (S::PendingApproval, A::Reject) => S::ShareRejected,
            (S::ShareApproved, A::Start) => S::ShareInProgress,
            (S::RevokeApproved, A::Start) => S::RevokeInProgress,
            (S::ShareInProgress | S::ShareFailed | S::ShareSucceeded, A::Success) => {
                S::ShareSucceeded
            }
            (S::RevokeInProgress | S::RevokeFailed, A::Success) => S::RevokeSucceeded,
            (S::ShareApproved | S::ShareInProgress | S::ShareFailed, A::Failure) => S::ShareFailed,
            (S::RevokeApproved | S::RevokeInProgress | S::RevokeFailed, A::Failure) => {
                S::RevokeFailed
            }
            (S::ShareSucceeded, A::RevokeItems) => S::RevokeApproved,
            (from, action) => {
                return Err(ShareError::InvalidTransition {
                    entity: "share item".to_string(),
                    from: from.to_string(),
                    action: action.to_string(),
                })
            }
        };
        Ok(next)
    }
}

/// Check that every item status is legal for the object status.
pub fn check_item_consistency<I>(object: ShareObjectStatus, items: I) -> Result<()>
where
    I: IntoIterator<Item = ShareItemStatus>,
{
    for item in items {
        if !object.admits_item_status(item) {
            return Err(ShareError::ConflictError(format!(
                "Item status {} is not allowed while share is {}",
                item, object
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_object_transitions() {
        let s = ShareObjectStatus::Draft;
        let s = s.transition(ShareObjectAction::Submit).unwrap();
        assert_eq!(s, ShareObjectStatus::Submitted);
        let s = s.transition(ShareObjectAction::Approve).unwrap();
        assert_eq!(s, ShareObjectStatus::Approved);
        let s = s.transition(ShareObjectAction::Start).unwrap();
        assert_eq!(s, ShareObjectStatus::ShareInProgress);
        let s = s.transition(ShareObjectAction::Finish).unwrap();
        assert_eq!(s, ShareObjectStatus::Processed);
        let s = s.transition(ShareObjectAction::RevokeItems).unwrap();
        assert_eq!(s, ShareObjectStatus::Revoked);
        let s = s.transition(ShareObjectAction::Start).unwrap();
        assert_eq!(s, ShareObjectStatus::RevokeInProgress);
        let s = s.transition(ShareObjectAction::Finish).unwrap();
        assert_eq!(s, ShareObjectStatus::Processed);
        let s = s.transition(ShareObjectAction::Delete).unwrap();
        assert_eq!(s, ShareObjectStatus::Deleted);
    }

    #[test]
    fn test_reject_only_from_submitted() {
        assert_eq!(
            ShareObjectStatus::Submitted
                .transition(ShareObjectAction::Reject)
                .unwrap(),
            ShareObjectStatus::Rejected
        );
        for status in [
            ShareObjectStatus::Draft,
            ShareObjectStatus::Approved,
            ShareObjectStatus::Processed,
        ] {
            let err = status.transition(ShareObjectAction::Reject).unwrap_err();
            assert!(matches!(err, ShareError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_rejected_is_terminal_except_delete() {
        for action in [
            ShareObjectAction::Submit,
            ShareObjectAction::Approve,
            ShareObjectAction::AddItem,
            ShareObjectAction::Start,
        ] {
            assert!(ShareObjectStatus::Rejected.transition(action).is_err());
        }
        assert_eq!(
            ShareObjectStatus::Rejected
                .transition(ShareObjectAction::Delete)
                .unwrap(),
            ShareObjectStatus::Deleted
        );
    }

    #[test]
    fn test_cannot_delete_mid_batch() {
        for status in [
            ShareObjectStatus::Approved,
            ShareObjectStatus::ShareInProgress,
            ShareObjectStatus::Revoked,
            ShareObjectStatus::RevokeInProgress,
        ] {
            assert!(status.transition(ShareObjectAction::Delete).is_err());
        }
    }

    #[test]
    fn test_item_share_and_revoke_paths() {
        let s = ShareItemStatus::PendingApproval
            .transition(ShareItemAction::Approve)
            .unwrap();
        let s = s.transition(ShareItemAction::Start).unwrap();
        assert_eq!(s, ShareItemStatus::ShareInProgress);
        let s = s.transition(ShareItemAction::Success).unwrap();
        assert_eq!(s, ShareItemStatus::ShareSucceeded);
        let s = s.transition(ShareItemAction::RevokeItems).unwrap();
        assert_eq!(s, ShareItemStatus::RevokeApproved);
        let s = s.transition(ShareItemAction::Start).unwrap();
        let s = s.transition(ShareItemAction::Failure).unwrap();
        assert_eq!(s, ShareItemStatus::RevokeFailed);
        let s = s.transition(ShareItemAction::Success).unwrap();
        assert_eq!(s, ShareItemStatus::RevokeSucceeded);
    }

    #[test]
    fn test_revoke_requires_succeeded_item() {
        for status in [
            ShareItemStatus::PendingApproval,
            ShareItemStatus::ShareFailed,
            ShareItemStatus::ShareInProgress,
            ShareItemStatus::RevokeSucceeded,
        ] {
            assert!(status.transition(ShareItemAction::RevokeItems).is_err());
        }
    }

    #[test]
    fn test_every_object_transition_keeps_items_consistent() {
        // Pair each object transition with the item transition it drives and
        // check the resulting statuses against the consistency table.
        let cases = [
            (
                ShareObjectStatus::Submitted,
                ShareObjectAction::Approve,
                ShareItemStatus::PendingApproval,
                Some(ShareItemAction::Approve),
            ),
            (
                ShareObjectStatus::Submitted,
                ShareObjectAction::Reject,
                ShareItemStatus::PendingApproval,
                Some(ShareItemAction::Reject),
            ),
            (
                ShareObjectStatus::Approved,
                ShareObjectAction::Start,
                ShareItemStatus::ShareApproved,
                Some(ShareItemAction::Start),
            ),
            (
                ShareObjectStatus::ShareInProgress,
                ShareObjectAction::Finish,
                ShareItemStatus::ShareInProgress,
                Some(ShareItemAction::Success),
            ),
            (
                ShareObjectStatus::Processed,
                ShareObjectAction::RevokeItems,
                ShareItemStatus::ShareSucceeded,
                Some(ShareItemAction::RevokeItems),
            ),
            (
                ShareObjectStatus::Revoked,
                ShareObjectAction::Start,
                ShareItemStatus::RevokeApproved,
                Some(ShareItemAction::Start),
            ),
            (
                ShareObjectStatus::RevokeInProgress,
                ShareObjectAction::Finish,
                ShareItemStatus::RevokeInProgress,
                Some(ShareItemAction::Failure),
            ),
            (
                ShareObjectStatus::Draft,
                ShareObjectAction::Submit,
                ShareItemStatus::PendingApproval,
                None,
            ),
        ];

        for (object, object_action, item, item_action) in cases {
            assert!(object.admits_item_status(item));
            let next_object = object.transition(object_action).unwrap();
            let next_item = match item_action {
                Some(a) => item.transition(a).unwrap(),
                None => item,
            };
            check_item_consistency(next_object, [next_item]).unwrap();
        }
    }

    #[test]
    fn test_inconsistent_item_is_reported() {
        let err =
            check_item_consistency(ShareObjectStatus::Draft, [ShareItemStatus::ShareInProgress])
                .unwrap_err();
        assert!(matches!(err, ShareError::ConflictError(_)));
    }
}
