// Thin illustrative bootstrap: a single node running the Hello counter
// application over the in-memory transport. Real cluster bootstrap (peer
// discovery, TLS, process supervision) is out of scope here; this is
// just enough to show a `Hive` wired up and serving traffic end to end.

use std::sync::Arc;

use beehive::{Hive, HiveConfig};
use beehive_app::{
    Application, AppOptions, Decode, MapContext, MapResult, Message, RcvContext, RcvResult,
    TypedHandler,
};
use beehive_base::{Cell, Result, TraceId, TypeTag};
use beehive_net::{InMemorySwitchboard, NodeID};

struct Counted(Vec<u8>);

impl Decode for Counted {
    fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Counted(payload.to_vec()))
    }
}

fn map_fn(m: &Counted, _ctx: &mut dyn MapContext) -> MapResult {
    Ok(vec![Cell::new("hello", m.0.clone())])
}

fn rcv_fn(m: &Counted, ctx: &mut dyn RcvContext) -> RcvResult {
    let cell = Cell::new("hello", m.0.clone());
    let count = ctx.get(&cell).map(|(v, _)| v[0]).unwrap_or(0);
    ctx.put(cell, vec![count + 1]);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let switchboard = InMemorySwitchboard::new();
    let transport = Arc::new(switchboard.register(NodeID(1)).await);
    let hive = Hive::new(HiveConfig::single_node(NodeID(1)), transport);

    let mut app = Application::new("Hello", AppOptions::default());
    app.register(Arc::new(TypedHandler::new("counted", map_fn, rcv_fn)));
    hive.register_app(Arc::new(app)).await;

    hive.run();

    for who in ["alice", "alice", "bob"] {
        let msg = Message::new(TypeTag::from("counted"), who.as_bytes().to_vec(), TraceId(0));
        match hive.dispatch(msg).await {
            Ok(outcome) => tracing::info!(?outcome, who, "dispatched"),
            Err(e) => tracing::error!(error = %e, who, "dispatch failed"),
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    hive.shutdown().await;
}
