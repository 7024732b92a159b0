//! Ties a bound [`utils::endpoint::TokioListener`] to whichever protocol it
//! was configured to speak.

use std::time::Duration;

use utils::endpoint::TokioListener;

use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socketmap,
    Milter,
}

/// Runs the accept loop for `listener` until the process exits. Does not
/// return; intended to be spawned as its own task per configured endpoint.
pub async fn run(listener: TokioListener, protocol: Protocol, ctx: Context, keep_alive: Duration) {
    match (listener, protocol) {
        (TokioListener::Tcp(l), Protocol::Socketmap) => {
            crate::socketmap::serve_tcp(l, ctx, keep_alive).await
        }
        (TokioListener::Unix(l, _lock), Protocol::Socketmap) => {
            crate::socketmap::serve_unix(l, ctx, keep_alive).await
        }
        (TokioListener::Tcp(l), Protocol::Milter) => crate::milter::serve_tcp(l, ctx).await,
        (TokioListener::Unix(l, _lock), Protocol::Milter) => {
            crate::milter::serve_unix(l, ctx).await
        }
    }
}
