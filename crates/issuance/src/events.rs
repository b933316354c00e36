//! Listener notifications
//!
//! A listener reports everything it observes through [`ListenerEvents`].
//! Callbacks run on the listener's task; a slow callback delays that
//! listener only.

use account_store::{BoxFuture, CredentialId, RequestId, RequesterId};
use platform::SelfIdentity;
use tokio::sync::mpsc;

use crate::error::ListenerFailure;

/// Who a listener is running for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerContext {
    pub credential_id: CredentialId,
    pub requester_id: RequesterId,
    /// Set when the listener was started for an issuance request.
    pub request_id: Option<RequestId>,
}

/// Receiver of listener notifications.
///
/// `on_timeout` and `on_error` are terminal: at most one of them fires per
/// run, and nothing fires after it. A stopped listener fires neither.
pub trait ListenerEvents: Send + Sync {
    fn on_connected<'a>(
        &'a self,
        ctx: ListenerContext,
        identity: &'a SelfIdentity,
    ) -> BoxFuture<'a, ()>;

    fn on_code<'a>(&'a self, ctx: ListenerContext, code: &'a str) -> BoxFuture<'a, ()>;

    fn on_timeout(&self, ctx: ListenerContext) -> BoxFuture<'_, ()>;

    fn on_error<'a>(&'a self, ctx: ListenerContext, failure: &'a ListenerFailure)
    -> BoxFuture<'a, ()>;
}

/// Notification as a value, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerNotice {
    Connected {
        ctx: ListenerContext,
        identity: SelfIdentity,
    },
    Code {
        ctx: ListenerContext,
        code: String,
    },
    Timeout {
        ctx: ListenerContext,
    },
    Error {
        ctx: ListenerContext,
        failure: ListenerFailure,
    },
}

impl ListenerNotice {
    pub fn credential_id(&self) -> CredentialId {
        match self {
            ListenerNotice::Connected { ctx, .. }
            | ListenerNotice::Code { ctx, .. }
            | ListenerNotice::Timeout { ctx }
            | ListenerNotice::Error { ctx, .. } => ctx.credential_id,
        }
    }
}

/// Forwards every notification into an unbounded channel.
///
/// Sends to a closed channel are dropped.
#[derive(Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<ListenerNotice>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notice: ListenerNotice) {
        let _ = self.tx.send(notice);
    }
}

impl ListenerEvents for ChannelEvents {
    fn on_connected<'a>(
        &'a self,
        ctx: ListenerContext,
        identity: &'a SelfIdentity,
    ) -> BoxFuture<'a, ()> {
        self.send(ListenerNotice::Connected {
            ctx,
            identity: identity.clone(),
        });
        Box::pin(async {})
    }

    fn on_code<'a>(&'a self, ctx: ListenerContext, code: &'a str) -> BoxFuture<'a, ()> {
        self.send(ListenerNotice::Code {
            ctx,
            code: code.to_string(),
        });
        Box::pin(async {})
    }

    fn on_timeout(&self, ctx: ListenerContext) -> BoxFuture<'_, ()> {
        self.send(ListenerNotice::Timeout { ctx });
        Box::pin(async {})
    }

    fn on_error<'a>(
        &'a self,
        ctx: ListenerContext,
        failure: &'a ListenerFailure,
    ) -> BoxFuture<'a, ()> {
        self.send(ListenerNotice::Error {
            ctx,
            failure: failure.clone(),
        });
        Box::pin(async {})
    }
}
