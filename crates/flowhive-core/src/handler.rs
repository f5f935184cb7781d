// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability traits node logic plugs into the runtime with.
//!
//! A concrete node is a composition of these: a processing node provides a
//! [`MessageHandler`], a source node an [`Emitter`], and any node may add
//! [`CommandHandler`]s for its own commands. All of them run with the state
//! write lock held and receive it through the [`HandlerContext`].

use async_trait::async_trait;

use flowhive_protocol::{Command, Headers};

use crate::service::HandlerContext;

/// Handles inbound messages of a processing node.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message.
    ///
    /// Errors (and panics) are turned into error reports with the message as
    /// cause; they never stop the node.
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, '_>,
        message: &str,
        headers: &Headers,
    ) -> anyhow::Result<()>;
}

/// Handles remote commands.
///
/// Called for every command after the built-in `shutdown`, `suspend` and
/// `resume` handling, so implementations ignore names they do not know.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(
        &self,
        ctx: &mut HandlerContext<'_, '_>,
        command: &Command,
    ) -> anyhow::Result<()>;
}

/// Hooks around each emission of a periodic node.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn before_send(&self, _ctx: &mut HandlerContext<'_, '_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_send(
        &self,
        _ctx: &mut HandlerContext<'_, '_>,
        _message: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
