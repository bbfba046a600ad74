//! The ingress boundary.
//!
//! The graph itself is synchronous; this module owns it from a single task
//! that drains a bounded channel of inputs and forwards flushed dataplane
//! messages to an output channel. The returned future is `!Send` (the graph
//! is `Rc`-wired), so drive it on a current-thread runtime or a `LocalSet`.

use crate::{config::ConfigResolver, sequencer::EventSequencer, CalcGraph};
use anyhow::{Context, Result};
use std::{cell::RefCell, rc::Rc};
use tokio::sync::mpsc;
use warden_policy_core::{
    model::{SyncStatus, Update},
    proto::DataplaneMessage,
};

/// One input to the engine. `Flush` is the only point at which output is
/// produced.
#[derive(Clone, Debug)]
pub enum GraphInput {
    Update(Update),
    Status(SyncStatus),
    Flush,
}

/// Runs the calculation graph until the input channel closes.
///
/// Config parse failures are fatal and returned; invariant violations in
/// the graph panic. If the output receiver is dropped the worker stops
/// cleanly.
pub async fn run(
    hostname: impl Into<String>,
    config: Box<dyn ConfigResolver>,
    mut inputs: mpsc::Receiver<GraphInput>,
    outputs: mpsc::Sender<DataplaneMessage>,
) -> Result<()> {
    let sequencer = Rc::new(RefCell::new(EventSequencer::new(config)));
    let graph = CalcGraph::new(hostname, sequencer.clone());

    let mut buf = Vec::new();
    while let Some(input) = inputs.recv().await {
        match input {
            GraphInput::Update(update) => graph.on_update(&update),
            GraphInput::Status(status) => graph.on_status(status),
            GraphInput::Flush => {
                sequencer
                    .borrow_mut()
                    .flush(&mut |msg| buf.push(msg))
                    .context("flushing dataplane updates")?;
                tracing::debug!(messages = buf.len(), "Flushed");
                for msg in buf.drain(..) {
                    if outputs.send(msg).await.is_err() {
                        tracing::debug!("Dataplane receiver dropped; stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
    tracing::debug!("Input channel closed; stopping");
    Ok(())
}
