//! Key and channel names in the shared presence/messaging store.
//!
//! These names are part of the cluster's external interface: every gateway
//! node, and any out-of-band service that refreshes group membership, must
//! agree on them.

use crate::ids::{GroupId, NodeId, UserId};

/// Prefix of presence records.
pub const USER_LOCATION_PREFIX: &str = "user_location:";

/// Prefix of cached group-membership snapshots.
pub const GROUP_MEMBERS_PREFIX: &str = "group_member_by_id:";

/// Prefix of per-node unicast channels.
pub const NODE_CHANNEL_PREFIX: &str = "gateway_node:";

/// Shared fan-out channel for group deliveries.
pub const GROUP_BROADCAST_CHANNEL: &str = "group_broadcast";

/// `user_location:<user>`
#[must_use]
pub fn user_location(user_id: &UserId) -> String {
    format!("{USER_LOCATION_PREFIX}{user_id}")
}

/// `group_member_by_id:<group>`
#[must_use]
pub fn group_members(group_id: &GroupId) -> String {
    format!("{GROUP_MEMBERS_PREFIX}{group_id}")
}

/// `gateway_node:<node>`
#[must_use]
pub fn node_channel(node_id: &NodeId) -> String {
    format!("{NODE_CHANNEL_PREFIX}{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_names() {
        let user = Uuid::nil();
        assert_eq!(
            user_location(&user),
            "user_location:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(node_channel(&NodeId::from("7")), "gateway_node:7");
        assert!(group_members(&user).starts_with("group_member_by_id:"));
    }
}
