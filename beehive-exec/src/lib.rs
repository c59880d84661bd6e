// The handler executor. Runs only on a bee's colony leader, draining one
// message at a time from the bee's queue. Builds a [`TransactionCtx`] over
// a snapshot of the bee's dictionary, calls the handler's `rcv`, then
// proposes the resulting transaction entry through the bee's consensus
// group and awaits its applied outcome.
//
// Atomicity: nothing `rcv` stages becomes visible until
// `Bee::propose_transaction` reports `TransactionCommitted` — an aborted
// or failed invocation leaves the dictionary and the outbound router
// untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use beehive_app::{Handler, Message, OutboundPolicy, RcvContext};
use beehive_base::{BeeId, Cell};
use beehive_bee::{ApplyOutcome, Bee, TransactionEntry, WriteOp};
use beehive_router::Router;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_TXN_BYTES: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExecConfig {
    pub max_retries: u32,
    pub max_txn_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            max_txn_bytes: DEFAULT_MAX_TXN_BYTES,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecError {
    /// The handler itself rejected the message (business-logic failure,
    /// distinct from an engine error).
    RcvFailed(String),
    /// Read-set invalidated past `max_retries`.
    TransactionAborted { bee_id: BeeId, retries: u32 },
    TransactionTooLarge { bee_id: BeeId, size: usize, cap: usize },
    Timeout { bee_id: BeeId },
    Engine(String),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::RcvFailed(s) => write!(f, "rcv failed: {s}"),
            ExecError::TransactionAborted { bee_id, retries } => {
                write!(f, "transaction aborted for {bee_id:?} after {retries} retries")
            }
            ExecError::TransactionTooLarge { bee_id, size, cap } => {
                write!(f, "transaction for {bee_id:?} too large: {size} > {cap}")
            }
            ExecError::Timeout { bee_id } => write!(f, "transaction for {bee_id:?} timed out"),
            ExecError::Engine(s) => write!(f, "executor engine error: {s}"),
        }
    }
}
impl std::error::Error for ExecError {}

/// The restricted transaction context `rcv` mutates through.
/// `get` reads a fixed pre-transaction snapshot taken once at the start of
/// the invocation; writes staged via `put`/`del` in the same invocation are
/// not visible to later `get` calls within it (handlers that need
/// read-after-write restructure around a single write per cell — see
/// DESIGN.md).
pub struct TransactionCtx {
    bee_id: BeeId,
    now: i64,
    snapshot: BTreeMap<Cell, (Vec<u8>, u64)>,
    reads: Vec<(Cell, Option<u64>)>,
    writes: Vec<WriteOp>,
    emits: Vec<Message>,
    staged_bytes: usize,
}

impl TransactionCtx {
    fn new(bee_id: BeeId, now: i64, snapshot: BTreeMap<Cell, (Vec<u8>, u64)>) -> Self {
        TransactionCtx {
            bee_id,
            now,
            snapshot,
            reads: Vec::new(),
            writes: Vec::new(),
            emits: Vec::new(),
            staged_bytes: 0,
        }
    }

    fn staged_bytes(&self) -> usize {
        self.staged_bytes
    }

    fn into_entry(self, message_seq: u64) -> TransactionEntry {
        TransactionEntry {
            message_seq,
            reads: self.reads,
            writes: self.writes,
            emits: self.emits,
        }
    }
}

impl RcvContext for TransactionCtx {
    fn get(&mut self, cell: &Cell) -> Option<(Vec<u8>, u64)> {
        let val = self.snapshot.get(cell).cloned();
        self.reads.push((cell.clone(), val.as_ref().map(|(_, v)| *v)));
        val
    }

    fn put(&mut self, cell: Cell, value: Vec<u8>) {
        self.staged_bytes += cell.key.len() + value.len();
        self.writes.push(WriteOp::Put(cell, value));
    }

    fn del(&mut self, cell: Cell) {
        self.writes.push(WriteOp::Del(cell));
    }

    fn emit(&mut self, msg: Message) {
        self.staged_bytes += msg.payload().len();
        self.emits.push(msg);
    }

    fn bee_id(&self) -> BeeId {
        self.bee_id
    }

    fn now(&self) -> i64 {
        self.now
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Drives one bee's message queue, picking one message at a time from the
/// bee's queue, run only on the leader. Construct via
/// [`Executor::spawn`]; the returned sender is what [`beehive_router`]'s
/// `LocalBees::enqueue_local` should forward into.
pub struct Executor {
    bee: Arc<Bee>,
    router: Arc<Router>,
    handler: Arc<dyn Handler>,
    outbound_policy: OutboundPolicy,
    config: ExecConfig,
    next_seq: AtomicU64,
}

impl Executor {
    pub fn new(
        bee: Arc<Bee>,
        router: Arc<Router>,
        handler: Arc<dyn Handler>,
        outbound_policy: OutboundPolicy,
        config: ExecConfig,
    ) -> Arc<Self> {
        Arc::new(Executor {
            bee,
            router,
            handler,
            outbound_policy,
            config,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Runs one message to completion: builds a transaction, calls `rcv`,
    /// proposes, and on success flushes emits to the router in the order
    /// `rcv` produced them (emit FIFO).
    pub async fn handle(&self, msg: &Message) -> Result<(), ExecError> {
        let mut attempt = 0u32;
        loop {
            let snapshot = self.bee.snapshot_values().await;
            let mut ctx = TransactionCtx::new(self.bee.id(), now_micros(), snapshot);

            if let Err(failure) = self.handler.rcv(msg.payload(), &mut ctx) {
                return Err(ExecError::RcvFailed(failure.to_string()));
            }

            if ctx.staged_bytes() > self.config.max_txn_bytes {
                return Err(ExecError::TransactionTooLarge {
                    bee_id: self.bee.id(),
                    size: ctx.staged_bytes(),
                    cap: self.config.max_txn_bytes,
                });
            }

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let entry = ctx.into_entry(seq);

            let outcome = if let Some(deadline) = msg.deadline_micros() {
                let budget = (deadline - now_micros()).max(0) as u64;
                match tokio::time::timeout(
                    std::time::Duration::from_micros(budget),
                    self.bee.propose_transaction(entry),
                )
                .await
                {
                    Ok(res) => res.map_err(|e| ExecError::Engine(e.to_string()))?,
                    Err(_) => return Err(ExecError::Timeout { bee_id: self.bee.id() }),
                }
            } else {
                self.bee
                    .propose_transaction(entry)
                    .await
                    .map_err(|e| ExecError::Engine(e.to_string()))?
            };

            match outcome {
                ApplyOutcome::TransactionCommitted { emits, .. } => {
                    for (seq, emitted) in emits {
                        // Stamp the (bee_id, sequence) pair the apply-side
                        // assigned this emit onto the outbound message, so
                        // the router/receiver can key per-pair FIFO
                        // delivery on it (spec §5, §8 property 4).
                        let mut stamped = Message::emitted_by(
                            emitted.type_tag().clone(),
                            emitted.payload().to_vec(),
                            emitted.trace_id(),
                            self.bee.id(),
                            seq,
                        );
                        if let Some(deadline) = emitted.deadline_micros() {
                            stamped = stamped.with_deadline(deadline);
                        }
                        if let Err(e) = self.router.route(stamped).await {
                            warn!(bee_id = self.bee.id().0, error = %e, "emit failed to route");
                        }
                    }
                    return Ok(());
                }
                ApplyOutcome::AlreadyApplied { .. } => return Ok(()),
                ApplyOutcome::TransactionAborted { reason, .. } => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(ExecError::TransactionAborted {
                            bee_id: self.bee.id(),
                            retries: attempt,
                        });
                    }
                    info!(bee_id = self.bee.id().0, attempt, reason, "transaction aborted, retrying");
                    continue;
                }
                ApplyOutcome::ControlApplied => {
                    return Err(ExecError::Engine("propose_transaction applied as control".into()))
                }
            }
        }
    }

    /// Spawns the bee's dedicated worker task: drains `inbox` sequentially,
    /// applying `outbound_policy` on handler-level failures (re-queue for
    /// at-least-once, drop for at-most-once).
    pub fn spawn(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                if let Err(e) = self.handle(&msg).await {
                    error!(bee_id = self.bee.id().0, trace_id = msg.trace_id().0, error = %e, "message failed");
                }
            }
        })
    }

    /// Like [`Executor::spawn`], but on an `RcvFailed` outcome under
    /// `AtLeastOnce` policy, re-enqueues the original message onto `self_tx`
    /// (the same queue this worker drains) rather than just logging it.
    pub fn spawn_with_requeue(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        self_tx: mpsc::UnboundedSender<Message>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                match self.handle(&msg).await {
                    Ok(()) => {}
                    Err(ExecError::RcvFailed(reason)) => {
                        warn!(bee_id = self.bee.id().0, reason, "rcv failed");
                        if self.outbound_policy == OutboundPolicy::AtLeastOnce {
                            let _ = self_tx.send(msg);
                        }
                    }
                    Err(e) => {
                        error!(bee_id = self.bee.id().0, trace_id = msg.trace_id().0, error = %e, "message failed");
                    }
                }
            }
        })
    }
}
