// The router. For every inbound message, whether it arrived over the
// transport or was emitted by a handler, the router runs `map`, resolves
// the owning bee through the cell registry, and either hands the message
// to a locally-hosted bee or forwards it to the node currently leading
// that bee's colony.
//
// The router never executes `rcv` itself (that is `beehive-exec`) and
// never hosts a bee's state (`beehive-bee`). It reaches those through the
// [`LocalBees`] trait so this crate has no dependency on either — the
// cyclic reference bee/router/colony is broken by indirection through
// stable ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use beehive_app::{Application, Handler, MapResult, NullMapContext};
use beehive_base::{BeeId, Cell, Epoch, Result, TraceId, TypeTag};
use beehive_net::{decode_wire, encode_wire, NodeID, Transport, WireMessage};
use beehive_registry::{CellRegistry, RegistryError, Resolution};

pub use beehive_app::Message;

const MAX_MISROUTE_RETRIES: u32 = 3;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouterError {
    /// `map` returned cells owned by different bees.
    SplitCells(BTreeMap<BeeId, Vec<Cell>>),
    /// No handler is registered for this message's type tag.
    UnknownHandler(TypeTag),
    /// `map` itself failed (decode error or handler-reported mapping
    /// failure).
    MapFailed(String),
    /// Forwarding kept hitting `NotLeader`/`EpochStale` past the bounded
    /// retry count.
    NotLeader { bee_id: BeeId, retries: u32 },
    Transport(String),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::SplitCells(_) => write!(f, "router: SplitCells"),
            RouterError::UnknownHandler(t) => write!(f, "router: no handler for {t:?}"),
            RouterError::MapFailed(s) => write!(f, "router: map failed: {s}"),
            RouterError::NotLeader { bee_id, retries } => {
                write!(f, "router: {bee_id:?} misrouted after {retries} retries")
            }
            RouterError::Transport(s) => write!(f, "router: transport error: {s}"),
        }
    }
}
impl std::error::Error for RouterError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    EnqueuedLocal(BeeId),
    Forwarded { bee_id: BeeId, to: NodeID },
}

/// Indirection to whatever owns locally-hosted bees (the top-level `Hive`
/// in the `beehive` crate). Kept as a trait so `beehive-router` does not
/// depend on `beehive-bee`/`beehive-exec`.
#[async_trait]
pub trait LocalBees: Send + Sync {
    /// `Some` if this node currently hosts (leads) `bee_id`; enqueues the
    /// message for that bee's executor.
    async fn enqueue_local(&self, bee_id: BeeId, msg: Message) -> bool;

    /// Called after a claim succeeds naming this node as candidate:
    /// provisions a new local bee (colony + state machine + executor) for
    /// `bee_id` before the router proceeds to enqueue the claiming message.
    /// `handler` is the handler whose `map` produced `cells`, since a fresh
    /// bee needs an executor bound to it before it can run `rcv`.
    async fn provision(&self, bee_id: BeeId, cells: Vec<Cell>, handler: Arc<dyn Handler>) -> Result<()>;
}

struct LeaderBelief {
    node: NodeID,
    epoch: Epoch,
}

pub struct Router {
    node: NodeID,
    transport: Arc<dyn Transport>,
    registry: Arc<CellRegistry>,
    local: Arc<dyn LocalBees>,
    apps: RwLock<Vec<Arc<Application>>>,
    leader_belief: RwLock<BTreeMap<BeeId, LeaderBelief>>,
}

impl Router {
    pub fn new(
        node: NodeID,
        transport: Arc<dyn Transport>,
        registry: Arc<CellRegistry>,
        local: Arc<dyn LocalBees>,
    ) -> Self {
        Router {
            node,
            transport,
            registry,
            local,
            apps: RwLock::new(Vec::new()),
            leader_belief: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn register_app(&self, app: Arc<Application>) {
        self.apps.write().await.push(app);
    }

    async fn handler_for(&self, tag: &TypeTag) -> Option<Arc<dyn beehive_app::Handler>> {
        for app in self.apps.read().await.iter() {
            if let Some(h) = app.handler(tag) {
                return Some(h.clone());
            }
        }
        None
    }

    /// The router's per-message entry point. `msg` may have
    /// arrived over the transport or been emitted locally by a handler.
    pub async fn route(&self, msg: Message) -> std::result::Result<RouteOutcome, RouterError> {
        let handler = self
            .handler_for(msg.type_tag())
            .await
            .ok_or_else(|| RouterError::UnknownHandler(msg.type_tag().clone()))?;

        let cells = self.run_map(&handler, &msg)?;
        self.route_to_cells(cells, msg, handler).await
    }

    fn run_map(
        &self,
        handler: &Arc<dyn beehive_app::Handler>,
        msg: &Message,
    ) -> std::result::Result<Vec<Cell>, RouterError> {
        let mut ctx = NullMapContext;
        let result: MapResult = handler.map(msg.payload(), &mut ctx);
        result.map_err(|e| RouterError::MapFailed(e.to_string()))
    }

    async fn route_to_cells(
        &self,
        cells: Vec<Cell>,
        msg: Message,
        handler: Arc<dyn Handler>,
    ) -> std::result::Result<RouteOutcome, RouterError> {
        let mut attempts = 0;
        loop {
            match self.registry.lookup(&cells).await {
                Resolution::AllSame(bee_id) => {
                    if self.local.enqueue_local(bee_id, msg.clone()).await {
                        info!(bee_id = bee_id.0, trace_id = msg.trace_id().0, "routed locally");
                        return Ok(RouteOutcome::EnqueuedLocal(bee_id));
                    }
                    return self.forward(bee_id, msg, &mut attempts).await;
                }
                Resolution::Unowned(_) => {
                    match self.registry.claim(cells.clone()).await {
                        Ok(bee_id) => {
                            self.local
                                .provision(bee_id, cells.clone(), handler.clone())
                                .await
                                .map_err(|e| RouterError::Transport(e.to_string()))?;
                            self.local.enqueue_local(bee_id, msg.clone()).await;
                            return Ok(RouteOutcome::EnqueuedLocal(bee_id));
                        }
                        Err(RegistryError::Conflict(_)) => {
                            // Someone else's claim committed first; loop and
                            // re-lookup.
                            continue;
                        }
                        Err(e) => return Err(RouterError::Transport(e.to_string())),
                    }
                }
                Resolution::Split(split) => {
                    warn!(?split, "map produced a split cell set");
                    return Err(RouterError::SplitCells(split));
                }
            }
        }
    }

    async fn forward(
        &self,
        bee_id: BeeId,
        msg: Message,
        attempts: &mut u32,
    ) -> std::result::Result<RouteOutcome, RouterError> {
        loop {
            let belief = self.leader_belief.read().await.get(&bee_id).map(|b| b.node);
            let target = match belief {
                Some(node) => node,
                None => {
                    return Err(RouterError::NotLeader {
                        bee_id,
                        retries: *attempts,
                    })
                }
            };

            let wire = WireMessage {
                src: self.node,
                dst: target,
                type_tag: msg.type_tag().clone(),
                payload: msg.payload().to_vec(),
                from_bee_id: msg.from_bee_id(),
                from_seq: msg.from_seq(),
                trace_id: msg.trace_id(),
                target_bee: Some(bee_id),
                target_epoch: self.leader_belief.read().await.get(&bee_id).map(|b| b.epoch),
            };
            match self.transport.send(wire).await {
                Ok(()) => return Ok(RouteOutcome::Forwarded { bee_id, to: target }),
                Err(e) => {
                    *attempts += 1;
                    warn!(bee_id = bee_id.0, attempt = *attempts, error = %e, "misroute, retrying");
                    if *attempts > MAX_MISROUTE_RETRIES {
                        self.leader_belief.write().await.remove(&bee_id);
                        return Err(RouterError::NotLeader {
                            bee_id,
                            retries: *attempts,
                        });
                    }
                    continue;
                }
            }
        }
    }

    /// Refreshes the cached belief about who leads `bee_id`, called after a
    /// colony election or a registry epoch bump is observed.
    pub async fn note_leader(&self, bee_id: BeeId, node: NodeID, epoch: Epoch) {
        self.leader_belief
            .write()
            .await
            .insert(bee_id, LeaderBelief { node, epoch });
    }

    pub fn local_node(&self) -> NodeID {
        self.node
    }

    /// Decodes an inbound wire message and routes it as an ordinary
    /// message. Used by the node's ingestion task pulling off `Transport`.
    pub async fn route_wire(&self, wire: WireMessage) -> std::result::Result<RouteOutcome, RouterError> {
        let msg = match (wire.from_bee_id, wire.from_seq) {
            (Some(from), Some(seq)) => {
                Message::emitted_by(wire.type_tag, wire.payload, wire.trace_id, from, seq)
            }
            _ => Message::new(wire.type_tag, wire.payload, wire.trace_id),
        };
        self.route(msg).await
    }
}

pub fn encode(msg: &WireMessage) -> Result<Vec<u8>> {
    encode_wire(msg)
}

pub fn decode(buf: &[u8]) -> Result<WireMessage> {
    decode_wire(buf)
}

pub fn new_trace_id(raw: u128) -> TraceId {
    TraceId(raw)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    use beehive_app::{AppOptions, Decode, MapContext, RcvContext, RcvResult, TypedHandler};
    use beehive_consensus::LocalConsensusGroup;
    use beehive_net::InMemorySwitchboard;

    struct Counted(Vec<u8>);
    impl Decode for Counted {
        fn decode(payload: &[u8]) -> beehive_base::Result<Self> {
            Ok(Counted(payload.to_vec()))
        }
    }
    fn map_fn(m: &Counted, _ctx: &mut dyn MapContext) -> MapResult {
        Ok(vec![Cell::new("hello", m.0.clone())])
    }
    fn rcv_fn(_m: &Counted, _ctx: &mut dyn RcvContext) -> RcvResult {
        Ok(())
    }

    struct RecordingLocalBees {
        enqueued: Mutex<Vec<(BeeId, Vec<u8>)>>,
        provisioned: Mutex<Vec<BeeId>>,
    }

    impl RecordingLocalBees {
        fn new() -> Self {
            RecordingLocalBees {
                enqueued: Mutex::new(Vec::new()),
                provisioned: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LocalBees for RecordingLocalBees {
        async fn enqueue_local(&self, bee_id: BeeId, msg: Message) -> bool {
            self.enqueued.lock().unwrap().push((bee_id, msg.payload().to_vec()));
            true
        }
        async fn provision(&self, bee_id: BeeId, _cells: Vec<Cell>, _handler: Arc<dyn Handler>) -> Result<()> {
            self.provisioned.lock().unwrap().push(bee_id);
            Ok(())
        }
    }

    async fn router_with(local: Arc<RecordingLocalBees>) -> Router {
        let group: Arc<dyn beehive_consensus::ConsensusGroup> = Arc::new(LocalConsensusGroup::new());
        let registry = CellRegistry::new(group);
        let switchboard = InMemorySwitchboard::new();
        let transport = Arc::new(switchboard.register(NodeID(1)).await);
        Router::new(NodeID(1), transport, registry, local)
    }

    fn app() -> Arc<Application> {
        let mut app = Application::new("Hello", AppOptions::default());
        app.register(Arc::new(TypedHandler::new("counted", map_fn, rcv_fn)));
        Arc::new(app)
    }

    #[tokio::test]
    async fn unowned_cell_is_claimed_then_enqueued_locally() {
        let local = Arc::new(RecordingLocalBees::new());
        let router = router_with(local.clone()).await;
        router.register_app(app()).await;

        let msg = Message::new(TypeTag::from("counted"), b"A".to_vec(), TraceId(0));
        let outcome = router.route(msg).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::EnqueuedLocal(_)));
        assert_eq!(local.provisioned.lock().unwrap().len(), 1);
        assert_eq!(local.enqueued.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_cell_twice_reuses_the_same_bee() {
        let local = Arc::new(RecordingLocalBees::new());
        let router = router_with(local.clone()).await;
        router.register_app(app()).await;

        let m1 = Message::new(TypeTag::from("counted"), b"A".to_vec(), TraceId(0));
        let m2 = Message::new(TypeTag::from("counted"), b"A".to_vec(), TraceId(1));
        let o1 = router.route(m1).await.unwrap();
        let o2 = router.route(m2).await.unwrap();
        assert_eq!(o1, o2);
        // Only one claim should have happened.
        assert_eq!(local.provisioned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_handler_is_rejected() {
        let local = Arc::new(RecordingLocalBees::new());
        let router = router_with(local).await;
        let msg = Message::new(TypeTag::from("nope"), vec![], TraceId(0));
        let err = router.route(msg).await.unwrap_err();
        assert_eq!(err, RouterError::UnknownHandler(TypeTag::from("nope")));
    }

    #[tokio::test]
    async fn split_cells_is_rejected_without_claiming() {
        let local = Arc::new(RecordingLocalBees::new());
        let router = router_with(local.clone()).await;
        router.register_app(app()).await;

        // Claim "A" and "B" as two separate bees first.
        router
            .route(Message::new(TypeTag::from("counted"), b"A".to_vec(), TraceId(0)))
            .await
            .unwrap();
        router
            .route(Message::new(TypeTag::from("counted"), b"B".to_vec(), TraceId(1)))
            .await
            .unwrap();

        // A handler whose map spans both is simulated by directly calling
        // route_to_cells with both cells present.
        let cells = vec![Cell::new("hello", b"A".to_vec()), Cell::new("hello", b"B".to_vec())];
        let msg = Message::new(TypeTag::from("counted"), b"AB".to_vec(), TraceId(2));
        let handler: Arc<dyn Handler> = Arc::new(TypedHandler::new("counted", map_fn, rcv_fn));
        let err = router.route_to_cells(cells, msg, handler).await.unwrap_err();
        assert!(matches!(err, RouterError::SplitCells(_)));
    }
}
