//! Frames relayed between gateway nodes.
//!
//! A node that decides a recipient lives elsewhere publishes a relay frame on
//! the owner's channel (or on the shared group channel). The receiving node
//! hands the embedded envelope to its local hub unchanged.

use crate::envelope::OutboundEnvelope;
use crate::ids::{NodeId, UserId};
use serde::{Deserialize, Serialize};

/// A frame published on a cross-node channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Deliver one envelope to one user hosted by the subscribing node.
    Direct {
        recipient: UserId,
        envelope: OutboundEnvelope,
    },
    /// Deliver one envelope to every listed user a node hosts.
    Group {
        /// Node that already served its own members.
        origin: NodeId,
        recipients: Vec<UserId>,
        envelope: OutboundEnvelope,
    },
}

impl RelayFrame {
    /// Create a direct relay frame.
    #[must_use]
    pub fn direct(recipient: UserId, envelope: OutboundEnvelope) -> Self {
        Self::Direct {
            recipient,
            envelope,
        }
    }

    /// Create a group relay frame.
    #[must_use]
    pub fn group(origin: NodeId, recipients: Vec<UserId>, envelope: OutboundEnvelope) -> Self {
        Self::Group {
            origin,
            recipients,
            envelope,
        }
    }
}
