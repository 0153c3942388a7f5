// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tree reductions over the [`SpanningTree`].
//!
//! Every node calls [`ReductionEngine::reduce`] with the same tag. Leaves send
//! their value to their parent right away; interior nodes wait for one
//! contribution per child, fold them into their own value and forward the
//! result. The root ends up with the total and, for broadcast reductions,
//! pushes it back down the tree unchanged.
//!
//! Child contributions may arrive before the node's own call to `reduce`.
//! They are buffered as encoded bytes until the local value (and with it the
//! concrete type and combine function) is known.
//!
//! A contribution that does not decode as the local value type is never
//! folded: if it was buffered, the local call fails and the buffer is kept
//! for a retry; if it arrives later, the waiter fails and the node stops.
//!
//! A child that never reports stalls the reduction forever; there is no
//! timeout at this layer.

mod ops;
mod tag;

pub use ops::{FnReducer, Max, Min, Reducer, Sum, Union};
pub use tag::{ReduceScope, ReduceTag};

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use weft_backend::{CodecError, decode_payload, encode_payload};
use weft_common::NodeId;

use crate::error::{FatalReporter, ProtocolViolation, ReduceError};
use crate::handlers::{Handler, am_handler};
use crate::messenger::Messenger;
use crate::tree::SpanningTree;

pub(crate) const REDUCE_UP: &str = "_reduce_up";
pub(crate) const REDUCE_DOWN: &str = "_reduce_down";

type Completion = oneshot::Sender<Result<Option<Bytes>, ReduceError>>;

#[derive(Serialize, Deserialize)]
struct Contribution {
    tag: ReduceTag,
    from: NodeId,
    value: Bytes,
}

#[derive(Serialize, Deserialize)]
struct Outcome {
    tag: ReduceTag,
    value: Bytes,
}

/// Type-erased running total.
trait Accumulator: Send + Sync {
    fn absorb(&mut self, bytes: &[u8]) -> Result<(), CodecError>;
    fn encode(&self) -> Result<Bytes, CodecError>;
}

struct Typed<T, R> {
    value: Option<T>,
    reducer: R,
}

impl<T, R> Accumulator for Typed<T, R>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Reducer<T>,
{
    fn absorb(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        // values travel as Option<T> so an empty accumulator still encodes
        let Some(other) = decode_payload::<Option<T>>(bytes)? else {
            return Ok(());
        };
        self.value = Some(match self.value.take() {
            Some(acc) => self.reducer.combine(acc, other),
            None => other,
        });
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        encode_payload(&self.value)
    }
}

struct Local {
    acc: Box<dyn Accumulator>,
    broadcast: bool,
    done: Completion,
}

struct Instance {
    pending: BTreeSet<NodeId>,
    buffered: Vec<(NodeId, Bytes)>,
    local: Option<Local>,
}

impl Instance {
    fn new(children: &[NodeId]) -> Self {
        Self {
            pending: children.iter().copied().collect(),
            buffered: Vec::new(),
            local: None,
        }
    }

    fn is_ready(&self) -> bool {
        self.local.is_some() && self.pending.is_empty()
    }
}

pub struct ReductionEngine {
    tree: Arc<SpanningTree>,
    messenger: Arc<Messenger>,
    fatal: FatalReporter,
    instances: DashMap<ReduceTag, Instance>,
    awaiting: DashMap<ReduceTag, Completion>,
}

impl ReductionEngine {
    pub(crate) fn new(
        tree: Arc<SpanningTree>,
        messenger: Arc<Messenger>,
        fatal: FatalReporter,
    ) -> Self {
        Self {
            tree,
            messenger,
            fatal,
            instances: DashMap::new(),
            awaiting: DashMap::new(),
        }
    }

    /// Contribute `value` to the reduction identified by `tag`.
    ///
    /// The returned future resolves to `Some(total)` on the root, and on every
    /// node when `broadcast` is set. Other nodes get `None` once their
    /// contribution has gone to their parent.
    ///
    /// Contributing twice to a live tag is [`ReduceError::TagInUse`]. A value
    /// whose type does not match an already buffered child contribution is
    /// [`ReduceError::Incompatible`]; the tag stays usable.
    pub fn reduce<T, R>(
        &self,
        tag: ReduceTag,
        value: T,
        reducer: R,
        broadcast: bool,
    ) -> Result<impl Future<Output = Result<Option<T>, ReduceError>> + Send + 'static, ReduceError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Reducer<T>,
    {
        let (tx, rx) = oneshot::channel();
        let mut acc: Box<dyn Accumulator> = Box::new(Typed {
            value: Some(value),
            reducer,
        });

        {
            let mut instance = self
                .instances
                .entry(tag)
                .or_insert_with(|| Instance::new(self.tree.children()));
            if instance.local.is_some() {
                return Err(ReduceError::TagInUse(tag));
            }
            for (from, bytes) in &instance.buffered {
                acc.absorb(bytes).map_err(|source| ReduceError::Incompatible {
                    tag,
                    from: *from,
                    source,
                })?;
            }
            instance.buffered.clear();
            instance.local = Some(Local {
                acc,
                broadcast,
                done: tx,
            });
        }
        trace!(%tag, broadcast, "local contribution");
        self.try_complete(tag);

        Ok(async move {
            match rx.await.map_err(|_| ReduceError::Abandoned(tag))?? {
                Some(bytes) => {
                    let total: Option<T> = decode_payload(&bytes)?;
                    Ok(total)
                }
                None => Ok(None),
            }
        })
    }

    /// Reductions with state on this node.
    pub fn active(&self) -> usize {
        self.instances.len() + self.awaiting.len()
    }

    fn try_complete(&self, tag: ReduceTag) {
        if let Some((_, instance)) = self.instances.remove_if(&tag, |_, i| i.is_ready()) {
            self.complete(tag, instance);
        }
    }

    fn complete(&self, tag: ReduceTag, instance: Instance) {
        let Some(Local {
            acc,
            broadcast,
            done,
        }) = instance.local
        else {
            return;
        };

        let bytes = match acc.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = done.send(Err(e.into()));
                return;
            }
        };

        match self.tree.parent() {
            None => {
                trace!(%tag, "reduction complete at root");
                if broadcast {
                    self.send_down(tag, &bytes);
                }
                let _ = done.send(Ok(Some(bytes)));
            }
            Some(parent) => {
                let msg = Contribution {
                    tag,
                    from: self.tree.node(),
                    value: bytes,
                };
                if broadcast {
                    // registered before sending so the result cannot overtake it
                    self.awaiting.insert(tag, done);
                    if let Err(e) = self.messenger.send_system(parent, REDUCE_UP, &msg)
                        && let Some((_, done)) = self.awaiting.remove(&tag)
                    {
                        let _ = done.send(Err(e.into()));
                    }
                } else {
                    let sent = self.messenger.send_system(parent, REDUCE_UP, &msg);
                    let _ = done.send(sent.map(|_| None).map_err(ReduceError::from));
                }
            }
        }
    }

    fn send_down(&self, tag: ReduceTag, value: &Bytes) {
        let msg = Outcome {
            tag,
            value: value.clone(),
        };
        for child in self.tree.children() {
            self.messenger.notify(*child, REDUCE_DOWN, &msg);
        }
    }

    fn on_contribution(&self, msg: Contribution) {
        let Contribution { tag, from, value } = msg;
        let absorbed = {
            let mut instance = self
                .instances
                .entry(tag)
                .or_insert_with(|| Instance::new(self.tree.children()));
            if !instance.pending.remove(&from) {
                drop(instance);
                self.fatal
                    .report(ProtocolViolation::UnexpectedContribution { tag, from });
                return;
            }
            match instance.local.as_mut() {
                Some(local) => local.acc.absorb(&value),
                None => {
                    instance.buffered.push((from, value));
                    Ok(())
                }
            }
        };

        match absorbed {
            Ok(()) => self.try_complete(tag),
            Err(source) => self.fail(tag, from, source),
        }
    }

    /// A child sent a value of another type. The partial total is discarded
    /// and the local waiter fails.
    fn fail(&self, tag: ReduceTag, from: NodeId, source: CodecError) {
        if let Some((_, instance)) = self.instances.remove(&tag)
            && let Some(local) = instance.local
        {
            let _ = local.done.send(Err(ReduceError::Incompatible { tag, from, source }));
        }
        self.fatal
            .report(ProtocolViolation::IncompatibleContribution { tag, from });
    }

    fn on_outcome(&self, msg: Outcome) {
        self.send_down(msg.tag, &msg.value);
        match self.awaiting.remove(&msg.tag) {
            Some((_, done)) => {
                let _ = done.send(Ok(Some(msg.value)));
            }
            None => debug!(tag = %msg.tag, "broadcast result with no local waiter"),
        }
    }

    pub(crate) fn system_handlers(self: &Arc<Self>) -> Vec<Handler> {
        let up = {
            let engine = self.clone();
            am_handler(REDUCE_UP, move |ctx| {
                engine.on_contribution(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        let down = {
            let engine = self.clone();
            am_handler(REDUCE_DOWN, move |ctx| {
                engine.on_outcome(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        vec![up, down]
    }
}
