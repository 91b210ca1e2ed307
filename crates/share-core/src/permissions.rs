//! Permission names attached to groups through resource policies.
//!
//! The registry is assembled once and read everywhere through
//! [`PermissionRegistry::global`].

use crate::status::ShareableType;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const GET_SHARE_OBJECT: &str = "GET_SHARE_OBJECT";
pub const UPDATE_SHARE_OBJECT: &str = "UPDATE_SHARE_OBJECT";
pub const SUBMIT_SHARE_OBJECT: &str = "SUBMIT_SHARE_OBJECT";
pub const APPROVE_SHARE_OBJECT: &str = "APPROVE_SHARE_OBJECT";
pub const REJECT_SHARE_OBJECT: &str = "REJECT_SHARE_OBJECT";
pub const DELETE_SHARE_OBJECT: &str = "DELETE_SHARE_OBJECT";
pub const ADD_ITEM: &str = "ADD_ITEM";
pub const REMOVE_ITEM: &str = "REMOVE_ITEM";
pub const LIST_SHARED_ITEMS: &str = "LIST_SHARED_ITEMS";

pub const GET_DATASET_TABLE: &str = "GET_DATASET_TABLE";
pub const GET_DATASET_FOLDER: &str = "GET_DATASET_FOLDER";
pub const GET_DATASET_BUCKET: &str = "GET_DATASET_BUCKET";
pub const GET_WAREHOUSE_TABLE: &str = "GET_WAREHOUSE_TABLE";

/// Resource type tag used when attaching policies to a share.
pub const SHARE_OBJECT_RESOURCE: &str = "ShareObject";

/// Which side of a share a permission set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareSide {
    Requester,
    Approver,
}

/// Static permission sets for shares and shared items
#[derive(Debug)]
pub struct PermissionRegistry {
    share_object: HashMap<ShareSide, Vec<&'static str>>,
    item_read: HashMap<ShareableType, Vec<&'static str>>,
}

impl PermissionRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static PermissionRegistry {
        static REGISTRY: OnceLock<PermissionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PermissionRegistry::standard)
    }

    /// Build the standard permission sets.
    pub fn standard() -> Self {
        let requester = vec![
            GET_SHARE_OBJECT,
            UPDATE_SHARE_OBJECT,
            SUBMIT_SHARE_OBJECT,
            DELETE_SHARE_OBJECT,
            ADD_ITEM,
            REMOVE_ITEM,
            LIST_SHARED_ITEMS,
        ];
        let approver = vec![
            GET_SHARE_OBJECT,
            UPDATE_SHARE_OBJECT,
            APPROVE_SHARE_OBJECT,
            REJECT_SHARE_OBJECT,
            DELETE_SHARE_OBJECT,
            LIST_SHARED_ITEMS,
        ];

        let share_object = HashMap::from([
            (ShareSide::Requester, requester),
            (ShareSide::Approver, approver),
        ]);

        let item_read = HashMap::from([
            (ShareableType::Table, vec![GET_DATASET_TABLE]),
            (ShareableType::StorageLocation, vec![GET_DATASET_FOLDER]),
            (ShareableType::S3Bucket, vec![GET_DATASET_BUCKET]),
            (ShareableType::WarehouseTable, vec![GET_WAREHOUSE_TABLE]),
        ]);

        PermissionRegistry {
            share_object,
            item_read,
        }
    }

    pub fn share_object_permissions(&self, side: ShareSide) -> &[&'static str] {
        self.share_object
            .get(&side)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Permissions granted to the requester group on a successfully shared item.
    pub fn item_read_permissions(&self, item_type: ShareableType) -> &[&'static str] {
        self.item_read
            .get(&item_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_shareable_type_has_read_permissions() {
        let registry = PermissionRegistry::global();
        for item_type in ShareableType::ALL {
            assert!(!registry.item_read_permissions(*item_type).is_empty());
        }
    }

    #[test]
    fn test_requester_cannot_approve() {
        let registry = PermissionRegistry::standard();
        let requester = registry.share_object_permissions(ShareSide::Requester);
        assert!(requester.contains(&SUBMIT_SHARE_OBJECT));
        assert!(!requester.contains(&APPROVE_SHARE_OBJECT));

        let approver = registry.share_object_permissions(ShareSide::Approver);
        assert!(approver.contains(&APPROVE_SHARE_OBJECT));
        assert!(!approver.contains(&SUBMIT_SHARE_OBJECT));
    }
}
