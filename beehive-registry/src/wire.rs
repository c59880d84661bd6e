use serde::{Deserialize, Serialize};

use beehive_base::{BeeId, Cell};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Claim = 0,
    Transfer = 1,
    Release = 2,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub cells: Vec<Cell>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRequest {
    pub cells: Vec<Cell>,
    pub from: BeeId,
    pub to: BeeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub bee_id: BeeId,
}
