use serde::{Deserialize, Serialize};

/// A dictionary cell: `(dict_name, key)`. The unit of addressable state.
///
/// Ordered so cell sets can live in a `BTreeSet`/`BTreeMap`, which is what
/// gives `map`'s mapped-cell set a canonical, order-independent iteration
/// order (needed for deterministic footprint hashing and for stable
/// `Split`/`All-same` reporting).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub dict: String,
    pub key: Vec<u8>,
}

impl Cell {
    pub fn new(dict: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Cell {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

/// Stable, cluster-wide, monotonically allocated bee identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BeeId(pub u64);

/// Per-cell ownership-change counter. Bumped on every claim, transfer, or
/// colony leader re-announcement so stale forwarders can detect and refresh.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

/// Opaque correlation id threaded through a message's whole lifetime, used
/// only for tracing/log correlation; never interpreted by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TraceId(pub u128);

/// Stable identifier for a message's handler, carried on the wire so a
/// receiving node can dispatch without any runtime type reflection (see
/// §9 "Dynamic message typing").
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TypeTag(pub String);

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        TypeTag(s.to_string())
    }
}
