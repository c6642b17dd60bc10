//! The peer surface the processor and the download loop consume.
//!
//! Transport, connection management and blacklist bookkeeping live in
//! the network layer; this module only fixes the request/response
//! vocabulary and the two traits the core calls through.

use std::{fmt::Debug, sync::Arc};

use ember_data_model::{block::Block, BlockId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests the download loop sends. Serialized as JSON objects with a
/// `requestType` discriminator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "requestType", rename_all = "camelCase")]
pub enum PeerRequest {
    /// Probe the peer's chain weight.
    GetCumulativeDifficulty,
    /// Bisect toward a common ancestor with exponentially spaced ids.
    #[serde(rename_all = "camelCase")]
    GetMilestoneBlockIds {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_block_id: Option<BlockId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_milestone_block_id: Option<BlockId>,
    },
    /// Ids of the blocks after `block_id`, oldest first.
    #[serde(rename_all = "camelCase")]
    GetNextBlockIds { block_id: BlockId },
    /// Full blocks after `block_id`, oldest first.
    #[serde(rename_all = "camelCase")]
    GetNextBlocks { block_id: BlockId },
}

/// Response to [`PeerRequest::GetCumulativeDifficulty`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeDifficultyResponse {
    /// Decimal string; exact comparison decides fork choice.
    pub cumulative_difficulty: String,
    #[serde(default)]
    pub blockchain_height: Option<u32>,
}

/// Response to [`PeerRequest::GetMilestoneBlockIds`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneBlockIdsResponse {
    #[serde(default)]
    pub milestone_block_ids: Vec<BlockId>,
    /// Set when the peer has walked back to its earliest milestone.
    #[serde(default)]
    pub last: bool,
}

/// Response to [`PeerRequest::GetNextBlockIds`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextBlockIdsResponse {
    #[serde(default)]
    pub next_block_ids: Vec<BlockId>,
}

/// Response to [`PeerRequest::GetNextBlocks`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextBlocksResponse {
    #[serde(default)]
    pub next_blocks: Vec<Value>,
}

/// One remote node.
pub trait Peer: Send + Sync + Debug {
    /// The address the peer announces, if it accepts inbound
    /// connections. The download loop only pulls from announced peers.
    fn announced_address(&self) -> Option<String>;

    /// Send a request and wait for the JSON response. `None` means the
    /// peer could not be reached or answered garbage; the caller moves
    /// on to another peer.
    fn send(&self, request: &PeerRequest) -> Option<Value>;

    /// Mark the peer as misbehaving. The network layer decides how
    /// long to shun it.
    fn blacklist(&self, cause: &str);
}

/// The node's view of the peer set.
pub trait PeerNetwork: Send + Sync {
    /// Every currently connected peer. The download loop does its own
    /// random pick among the announced ones.
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Gossip a freshly accepted recent block to a subset of peers.
    fn broadcast_block(&self, block: &Block);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_carry_the_discriminator() {
        let probe = serde_json::to_value(PeerRequest::GetCumulativeDifficulty).unwrap();
        assert_eq!(probe["requestType"], "getCumulativeDifficulty");

        let walk = serde_json::to_value(PeerRequest::GetMilestoneBlockIds {
            last_block_id: Some(BlockId(5)),
            last_milestone_block_id: None,
        })
        .unwrap();
        assert_eq!(walk["requestType"], "getMilestoneBlockIds");
        assert_eq!(walk["lastBlockId"], "5");
        assert!(walk.get("lastMilestoneBlockId").is_none());
    }

    #[test]
    fn responses_tolerate_missing_fields() {
        let response: MilestoneBlockIdsResponse = serde_json::from_value(serde_json::json!({
            "milestoneBlockIds": ["1", "2"]
        }))
        .unwrap();
        assert_eq!(response.milestone_block_ids.len(), 2);
        assert!(!response.last);

        let empty: NextBlocksResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(empty.next_blocks.is_empty());
    }
}
