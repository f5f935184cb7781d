// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet-wide error reporting for one node.

use std::sync::Arc;

use tracing::{error, warn};

use flowhive_protocol::{ErrorMessage, ServiceIdentity};

use crate::broker::OutboundMessage;
use crate::channels::ChannelSet;

/// Publishes [`ErrorMessage`]s on behalf of one node.
///
/// Cheap to clone; every component that can fail on its own (the dispatch
/// wrapper, the retry engine, handlers) gets a copy instead of reaching for a
/// process-wide aggregator.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    identity: ServiceIdentity,
    channels: Arc<ChannelSet>,
}

impl ErrorReporter {
    pub fn new(identity: ServiceIdentity, channels: Arc<ChannelSet>) -> Self {
        Self { identity, channels }
    }

    /// Logs `text` at error level and publishes it with the optional cause.
    ///
    /// Returns whether the report reached the broker.
    pub async fn report(&self, text: impl Into<String>, cause: Option<&str>) -> bool {
        let text = text.into();
        error!(service = %self.identity, cause = cause.unwrap_or_default(), "{}", text);
        self.publish(ErrorMessage::new(&self.identity, text, cause)).await
    }

    /// Same as [`report`](Self::report) but logged as a warning.
    pub async fn warn(&self, text: impl Into<String>, cause: Option<&str>) -> bool {
        let text = text.into();
        warn!(service = %self.identity, "{}", text);
        self.publish(ErrorMessage::new(&self.identity, text, cause)).await
    }

    async fn publish(&self, report: ErrorMessage) -> bool {
        match report.to_vec() {
            Ok(body) => self.channels.publish_error(&OutboundMessage::new(body)).await,
            Err(e) => {
                error!(error = %e, "Failed to encode error report");
                false
            }
        }
    }
}
