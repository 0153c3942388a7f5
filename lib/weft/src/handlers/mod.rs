// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Active message handlers.
//!
//! - **`am_handler()`** - Sync handler: `Fn(Context) -> anyhow::Result<()>`
//! - **`am_handler_async()`** - Async handler: `Fn(Context) -> Future<anyhow::Result<()>>`
//!
//! The return value is for internal error handling only; nothing is sent back
//! to the sender. A handler may send any number of new messages through its
//! [`Context`], which tags them with the epoch of the message being handled.
//!
//! ```ignore
//! // Default spawn mode (runs on the node's task tracker)
//! let handler = am_handler("log", |ctx| {
//!     println!("from {}: {} bytes", ctx.source, ctx.payload.len());
//!     Ok(())
//! })
//! .build();
//!
//! // Inline mode runs on the dispatch loop, in arrival order. Keep it short.
//! let handler = am_handler("bump", |ctx| Ok(())).inline().build();
//! ```
//!
//! Names beginning with `_` are reserved for runtime handlers.

mod dispatcher;

pub(crate) use dispatcher::{DispatcherHub, run_dispatch_loop};

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use derive_getters::Dissolve;
use futures::future::{BoxFuture, FutureExt, ready};
use serde::de::DeserializeOwned;
use weft_backend::decode_payload;
use weft_common::{EpochId, NodeId};

use crate::node::Node;

/// Where a handler runs once its frame is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the dispatch loop, before the next frame is looked at.
    Inline,
    /// On a tracked task; frames after it may be handled concurrently.
    #[default]
    Spawn,
}

type HandlerFn = dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A named, registered active message handler.
pub struct Handler {
    name: String,
    mode: DispatchMode,
    exec: Arc<HandlerFn>,
}

impl Handler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub(crate) fn call(&self, ctx: Context) -> BoxFuture<'static, Result<()>> {
        (self.exec)(ctx)
    }

    /// Create a synchronous handler.
    pub fn am_handler<F>(name: impl Into<String>, f: F) -> HandlerBuilder
    where
        F: Fn(Context) -> Result<()> + Send + Sync + 'static,
    {
        am_handler(name, f)
    }

    /// Create an asynchronous handler.
    pub fn am_handler_async<F, Fut>(name: impl Into<String>, f: F) -> HandlerBuilder
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        am_handler_async(name, f)
    }
}

/// Create a synchronous handler: `Fn(Context) -> anyhow::Result<()>`.
pub fn am_handler<F>(name: impl Into<String>, f: F) -> HandlerBuilder
where
    F: Fn(Context) -> Result<()> + Send + Sync + 'static,
{
    HandlerBuilder {
        name: name.into(),
        mode: DispatchMode::default(),
        exec: Arc::new(move |ctx| ready(f(ctx)).boxed()),
    }
}

/// Create an asynchronous handler: `Fn(Context) -> impl Future<Output = anyhow::Result<()>>`.
pub fn am_handler_async<F, Fut>(name: impl Into<String>, f: F) -> HandlerBuilder
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerBuilder {
        name: name.into(),
        mode: DispatchMode::default(),
        exec: Arc::new(move |ctx| f(ctx).boxed()),
    }
}

pub struct HandlerBuilder {
    name: String,
    mode: DispatchMode,
    exec: Arc<HandlerFn>,
}

impl HandlerBuilder {
    /// Run on the dispatch loop.
    pub fn inline(mut self) -> Self {
        self.mode = DispatchMode::Inline;
        self
    }

    /// Run on a tracked task (the default).
    pub fn spawn(mut self) -> Self {
        self.mode = DispatchMode::Spawn;
        self
    }

    pub fn build(self) -> Handler {
        Handler {
            name: self.name,
            mode: self.mode,
            exec: self.exec,
        }
    }
}

/// Everything a handler gets to see about the message it is handling.
#[derive(Clone, Dissolve)]
pub struct Context {
    /// Node that sent the message.
    pub source: NodeId,

    /// Epoch the message was sent under. Sends made through [`Context::send`]
    /// inherit it.
    pub epoch: Option<EpochId>,

    pub payload: Bytes,

    pub node: Arc<Node>,
}

impl Context {
    /// Decode the payload as a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(decode_payload(&self.payload)?)
    }

    /// Send a message under the inherited epoch.
    pub fn send(&self, dest: NodeId, handler: &str, payload: Bytes) -> Result<()> {
        self.node.send(self.epoch, dest, handler, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_modes() {
        let handler = am_handler("a", |_ctx| Ok(())).build();
        assert_eq!(handler.mode(), DispatchMode::Spawn);
        assert_eq!(handler.name(), "a");

        let handler = Handler::am_handler_async("b", |_ctx| async { Ok(()) })
            .inline()
            .build();
        assert_eq!(handler.mode(), DispatchMode::Inline);

        let handler = am_handler("c", |_ctx| Ok(())).inline().spawn().build();
        assert_eq!(handler.mode(), DispatchMode::Spawn);
    }
}
