// The handler contract an application author links against: a `Message`
// type, the `Handler` trait pairing a deterministic `map` with a
// transactional `rcv`, and the `Application` that groups handlers under one
// set of persistence/replication options.
//
// Dispatch is by a stable `TypeTag` carried on the wire, not by the
// sender's runtime type: a `Handler`
// decodes its own payload, once for `map` and once for `rcv`, since those
// two calls may run on different nodes (map runs wherever a message first
// arrives; rcv runs only at the owning bee's colony leader).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use beehive_base::{BeeId, Cell, TraceId, TypeTag};

/// An immutable message once it has been enqueued. Construct with `new`;
/// there is deliberately no way to mutate one in place.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Message {
    type_tag: TypeTag,
    payload: Vec<u8>,
    from_bee_id: Option<BeeId>,
    /// The emitting bee's monotone per-bee emit sequence, set alongside
    /// `from_bee_id`. Together they are the `(bee_id, sequence)` pair §5
    /// and §8 property 4 require for per-pair FIFO delivery at the router.
    from_seq: Option<u64>,
    trace_id: TraceId,
    /// Microseconds since the Unix epoch after which the executor should
    /// give up on an in-flight transaction and reply `Timeout` rather than
    /// keep retrying. `None` means no deadline.
    deadline_micros: Option<i64>,
}

impl Message {
    pub fn new(type_tag: TypeTag, payload: Vec<u8>, trace_id: TraceId) -> Self {
        Message {
            type_tag,
            payload,
            from_bee_id: None,
            from_seq: None,
            trace_id,
            deadline_micros: None,
        }
    }

    /// A message emitted by a handler from within a transaction, carrying
    /// the emitting bee's id and its per-bee emit sequence for provenance.
    /// The executor calls this when flushing a committed transaction's
    /// emit list, stamping each message with the sequence
    /// `BeeState::apply_transaction` assigned it.
    pub fn emitted_by(
        type_tag: TypeTag,
        payload: Vec<u8>,
        trace_id: TraceId,
        from: BeeId,
        seq: u64,
    ) -> Self {
        Message {
            type_tag,
            payload,
            from_bee_id: Some(from),
            from_seq: Some(seq),
            trace_id,
            deadline_micros: None,
        }
    }

    pub fn with_deadline(mut self, deadline_micros: i64) -> Self {
        self.deadline_micros = Some(deadline_micros);
        self
    }

    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    pub fn from_bee_id(&self) -> Option<BeeId> {
        self.from_bee_id
    }
    pub fn from_seq(&self) -> Option<u64> {
        self.from_seq
    }
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }
    pub fn deadline_micros(&self) -> Option<i64> {
        self.deadline_micros
    }
}

/// A value a handler's `decode` step produces from a message payload. Kept
/// separate from `Message` itself because `map` and `rcv` both decode
/// independently (see module docs).
pub trait Decode: Send + 'static {
    fn decode(payload: &[u8]) -> beehive_base::Result<Self>
    where
        Self: Sized;
}

/// Extensibility point for `map`'s context parameter. `map` must remain a
/// pure, total, deterministic function of the message alone, so this trait
/// carries no mutable engine state today; it exists so the signature can
/// grow without breaking handler authors.
pub trait MapContext: Send {}

/// The zero-sized context every router uses today.
#[derive(Default)]
pub struct NullMapContext;
impl MapContext for NullMapContext {}

/// The transactional context `rcv` mutates through. Every `get` records an
/// observed version in the transaction's read set; every `put`/`del` stages
/// a write; `emit` stages an outbound message. Nothing becomes visible
/// outside the transaction until it commits.
pub trait RcvContext: Send {
    /// Reads a cell, recording its current version in the read set. `None`
    /// if the cell has no value (which is indistinguishable from deleted).
    fn get(&mut self, cell: &Cell) -> Option<(Vec<u8>, u64)>;
    fn put(&mut self, cell: Cell, value: Vec<u8>);
    fn del(&mut self, cell: Cell);
    fn emit(&mut self, msg: Message);
    fn bee_id(&self) -> BeeId;
    /// Wall-clock time supplied by the context (microseconds since epoch),
    /// never read directly from the system clock by `rcv` itself — doing so
    /// would break deterministic replay.
    fn now(&self) -> i64;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MapError {
    Decode(String),
    Handler(String),
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::Decode(s) => write!(f, "map: decode failed: {s}"),
            MapError::Handler(s) => write!(f, "map: {s}"),
        }
    }
}
impl std::error::Error for MapError {}

pub type MapResult = std::result::Result<Vec<Cell>, MapError>;

/// An application-level `rcv` failure (the handler's own business-logic
/// rejection, not an engine error). Distinct from `beehive_base::Error` so
/// the executor can distinguish "the handler said no" from "the engine
/// broke".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RcvFailure(pub String);

impl std::fmt::Display for RcvFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rcv failed: {}", self.0)
    }
}
impl std::error::Error for RcvFailure {}

pub type RcvResult = std::result::Result<(), RcvFailure>;

/// The object-safe handler surface the router and executor dispatch
/// through, keyed by `type_tag` rather than by Rust type.
pub trait Handler: Send + Sync {
    fn type_tag(&self) -> TypeTag;
    fn map(&self, payload: &[u8], ctx: &mut dyn MapContext) -> MapResult;
    fn rcv(&self, payload: &[u8], ctx: &mut dyn RcvContext) -> RcvResult;
}

/// A handler bound to a concrete decoded message type `T`. `map_fn`/`rcv_fn`
/// are plain function pointers (not closures) so a handler cannot
/// accidentally capture mutable state that would break determinism.
pub struct TypedHandler<T: Decode> {
    type_tag: TypeTag,
    map_fn: fn(&T, &mut dyn MapContext) -> MapResult,
    rcv_fn: fn(&T, &mut dyn RcvContext) -> RcvResult,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Decode> TypedHandler<T> {
    pub fn new(
        type_tag: impl Into<TypeTag>,
        map_fn: fn(&T, &mut dyn MapContext) -> MapResult,
        rcv_fn: fn(&T, &mut dyn RcvContext) -> RcvResult,
    ) -> Self {
        TypedHandler {
            type_tag: type_tag.into(),
            map_fn,
            rcv_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Decode> Handler for TypedHandler<T> {
    fn type_tag(&self) -> TypeTag {
        self.type_tag.clone()
    }

    fn map(&self, payload: &[u8], ctx: &mut dyn MapContext) -> MapResult {
        let decoded = T::decode(payload).map_err(|e| MapError::Decode(e.to_string()))?;
        (self.map_fn)(&decoded, ctx)
    }

    fn rcv(&self, payload: &[u8], ctx: &mut dyn RcvContext) -> RcvResult {
        let decoded =
            T::decode(payload).map_err(|e| RcvFailure(format!("decode failed: {e}")))?;
        (self.rcv_fn)(&decoded, ctx)
    }
}

/// Policy for a message that was accepted by a handler whose transaction
/// ultimately aborts or whose `rcv` returns an application-level failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutboundPolicy {
    /// Re-queue the original message to the input; dedup by message id on
    /// redelivery (the default).
    AtLeastOnce,
    /// Drop the message; the caller is responsible for its own retries.
    AtMostOnce,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        OutboundPolicy::AtLeastOnce
    }
}

/// Per-application options recognized by the runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppOptions {
    pub persistent: bool,
    pub replication_factor: u32,
    pub transactional: bool,
    pub outbound_policy: OutboundPolicy,
}

impl Default for AppOptions {
    fn default() -> Self {
        AppOptions {
            persistent: false,
            replication_factor: 1,
            transactional: true,
            outbound_policy: OutboundPolicy::AtLeastOnce,
        }
    }
}

pub struct HandlerDescriptor {
    pub type_tag: TypeTag,
    pub handler: Arc<dyn Handler>,
}

/// A named collection of handler descriptors, identical on every node:
/// `ConfigMismatch` is raised by the cluster bootstrap layer, not by this
/// type, if two nodes disagree.
pub struct Application {
    pub name: String,
    pub options: AppOptions,
    handlers: Vec<HandlerDescriptor>,
}

impl Application {
    pub fn new(name: impl Into<String>, options: AppOptions) -> Self {
        Application {
            name: name.into(),
            options,
            handlers: Vec::new(),
        }
    }

    /// Registers a handler. Returns `false` (and does not register) if
    /// `type_tag` is already bound within this application.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> bool {
        let tag = handler.type_tag();
        if self.handlers.iter().any(|h| h.type_tag == tag) {
            return false;
        }
        self.handlers.push(HandlerDescriptor {
            type_tag: tag,
            handler,
        });
        true
    }

    pub fn handler(&self, tag: &TypeTag) -> Option<&Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|h| &h.type_tag == tag)
            .map(|h| &h.handler)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Counted(Vec<u8>);
    impl Decode for Counted {
        fn decode(payload: &[u8]) -> beehive_base::Result<Self> {
            Ok(Counted(payload.to_vec()))
        }
    }

    fn map_fn(_m: &Counted, _ctx: &mut dyn MapContext) -> MapResult {
        Ok(vec![Cell::new("hello", b"k".to_vec())])
    }
    fn rcv_fn(_m: &Counted, _ctx: &mut dyn RcvContext) -> RcvResult {
        Ok(())
    }

    #[test]
    fn register_rejects_duplicate_type_tag() {
        let mut app = Application::new("Hello", AppOptions::default());
        let h1: Arc<dyn Handler> = Arc::new(TypedHandler::new("counted", map_fn, rcv_fn));
        let h2: Arc<dyn Handler> = Arc::new(TypedHandler::new("counted", map_fn, rcv_fn));
        assert!(app.register(h1));
        assert!(!app.register(h2));
        assert_eq!(app.handlers().count(), 1);
    }

    #[test]
    fn handler_maps_deterministically() {
        let mut ctx = NullMapContext;
        let h = TypedHandler::new("counted", map_fn, rcv_fn);
        let cells = h.map(b"A", &mut ctx).unwrap();
        assert_eq!(cells, vec![Cell::new("hello", b"k".to_vec())]);
    }
}
