//! Listener notifications for the operator log
//!
//! The chat front end that relays codes to requesters lives outside this
//! service; it reads delivered codes from the request records. This sink
//! only reports listener progress in the structured log.

use account_store::BoxFuture;
use issuance::{ListenerContext, ListenerEvents, ListenerFailure};
use platform::SelfIdentity;
use tracing::{info, warn};

pub struct LogNotifier;

impl ListenerEvents for LogNotifier {
    fn on_connected<'a>(
        &'a self,
        ctx: ListenerContext,
        identity: &'a SelfIdentity,
    ) -> BoxFuture<'a, ()> {
        info!(
            credential_id = ctx.credential_id,
            requester_id = ctx.requester_id,
            request_id = ctx.request_id,
            platform_user_id = identity.user_id,
            is_premium = identity.is_premium,
            "listener connected, waiting for code"
        );
        Box::pin(async {})
    }

    fn on_code<'a>(&'a self, ctx: ListenerContext, _code: &'a str) -> BoxFuture<'a, ()> {
        info!(
            credential_id = ctx.credential_id,
            requester_id = ctx.requester_id,
            request_id = ctx.request_id,
            "confirmation code ready for requester"
        );
        Box::pin(async {})
    }

    fn on_timeout(&self, ctx: ListenerContext) -> BoxFuture<'_, ()> {
        warn!(
            credential_id = ctx.credential_id,
            requester_id = ctx.requester_id,
            request_id = ctx.request_id,
            "no code arrived before the deadline"
        );
        Box::pin(async {})
    }

    fn on_error<'a>(
        &'a self,
        ctx: ListenerContext,
        failure: &'a ListenerFailure,
    ) -> BoxFuture<'a, ()> {
        warn!(
            credential_id = ctx.credential_id,
            requester_id = ctx.requester_id,
            request_id = ctx.request_id,
            reason = failure.kind(),
            error = %failure,
            "listener failed"
        );
        Box::pin(async {})
    }
}
