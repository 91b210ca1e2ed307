//! Caller identity and the role it holds on a share.

use crate::directory::Dataset;
use metafuse_share_core::ShareObject;
use serde::{Deserialize, Serialize};

/// Identity of the user issuing a share operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub username: String,
    pub groups: Vec<String>,
}

impl RequestContext {
    pub fn new(username: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            username: username.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_member(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Role of a caller on one share, derived at read time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareObjectRole {
    NoPermission,
    Requesters,
    Approvers,
    ApproversAndRequesters,
}

impl ShareObjectRole {
    pub fn is_requester(&self) -> bool {
        matches!(
            self,
            ShareObjectRole::Requesters | ShareObjectRole::ApproversAndRequesters
        )
    }

    pub fn is_approver(&self) -> bool {
        matches!(
            self,
            ShareObjectRole::Approvers | ShareObjectRole::ApproversAndRequesters
        )
    }
}

impl std::fmt::Display for ShareObjectRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShareObjectRole::NoPermission => "NoPermission",
            ShareObjectRole::Requesters => "Requesters",
            ShareObjectRole::Approvers => "Approvers",
            ShareObjectRole::ApproversAndRequesters => "ApproversAndRequesters",
        };
        f.write_str(s)
    }
}

/// Derive the caller's role from their groups, the requesting group of the
/// share and the dataset's admin and steward groups.
pub fn user_role_for_share(
    ctx: &RequestContext,
    share: &ShareObject,
    dataset: &Dataset,
) -> ShareObjectRole {
    let requester = ctx.is_member(&share.group_uri) || ctx.username == share.owner;
    let approver = dataset
        .approver_groups()
        .into_iter()
        .any(|g| ctx.is_member(g));

    match (requester, approver) {
        (true, true) => ShareObjectRole::ApproversAndRequesters,
        (true, false) => ShareObjectRole::Requesters,
        (false, true) => ShareObjectRole::Approvers,
        (false, false) => ShareObjectRole::NoPermission,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DatasetResource;
    use chrono::Utc;
    use metafuse_share_core::{PrincipalType, ShareObjectDataPermission, ShareObjectStatus};

    fn dataset() -> Dataset {
        Dataset {
            dataset_uri: "sales".to_string(),
            name: "Sales".to_string(),
            environment_uri: "env-producer".to_string(),
            aws_account_id: "111111111111".to_string(),
            region: "eu-west-1".to_string(),
            admin_group: "sales-admins".to_string(),
            stewards: Some("sales-stewards".to_string()),
            auto_approval_enabled: false,
            resource: DatasetResource::ObjectStorage {
                bucket: "sales-bucket".to_string(),
                kms_alias: None,
            },
        }
    }

    fn share() -> ShareObject {
        let now = Utc::now();
        ShareObject {
            share_uri: "share-1".to_string(),
            dataset_uri: "sales".to_string(),
            source_environment_uri: "env-producer".to_string(),
            target_environment_uri: "env-consumer".to_string(),
            group_uri: "analysts".to_string(),
            principal_id: "analysts".to_string(),
            principal_type: PrincipalType::Group,
            principal_role_name: "analysts-role".to_string(),
            permissions: vec![ShareObjectDataPermission::Read],
            status: ShareObjectStatus::Draft,
            owner: "alice".to_string(),
            request_purpose: None,
            reject_purpose: None,
            confirmed: false,
            created: now,
            updated: now,
            deleted: None,
        }
    }

    #[test]
    fn test_role_derivation() {
        let ds = dataset();
        let sh = share();

        let requester = RequestContext::new("bob", ["analysts"]);
        assert_eq!(user_role_for_share(&requester, &sh, &ds), ShareObjectRole::Requesters);

        let steward = RequestContext::new("carol", ["sales-stewards"]);
        assert_eq!(user_role_for_share(&steward, &sh, &ds), ShareObjectRole::Approvers);

        let both = RequestContext::new("dave", ["analysts", "sales-admins"]);
        assert_eq!(
            user_role_for_share(&both, &sh, &ds),
            ShareObjectRole::ApproversAndRequesters
        );

        let stranger = RequestContext::new("eve", ["finance"]);
        assert_eq!(user_role_for_share(&stranger, &sh, &ds), ShareObjectRole::NoPermission);

        // The owner keeps requester rights even after leaving the group
        let owner = RequestContext::new("alice", Vec::<String>::new());
        assert!(user_role_for_share(&owner, &sh, &ds).is_requester());
    }
}
