//! The Postfix socketmap protocol: netstring-framed
//! `<query-type> <map-name> <address>` requests, one task per connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

use utils::netstring;
use utils::netstring::NetstringError;

use crate::context::Context;

const READ_CHUNK: usize = 4096;

/// Accepts connections on `listener` forever, spawning one task per
/// connection.
pub async fn serve_tcp(listener: TcpListener, ctx: Context, keep_alive: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                trc::log(
                    trc::Level::Info,
                    trc::Event::ConnectionAccepted {
                        endpoint: "socketmap".into(),
                        peer: peer.to_string(),
                    },
                );
                tokio::spawn(async move {
                    handle_connection(stream, ctx, keep_alive).await;
                });
            }
            Err(e) => {
                tracing::warn!("socketmap accept failed: {e}");
            }
        }
    }
}

pub async fn serve_unix(listener: UnixListener, ctx: Context, keep_alive: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                trc::log(
                    trc::Level::Info,
                    trc::Event::ConnectionAccepted {
                        endpoint: "socketmap".into(),
                        peer: "unix".into(),
                    },
                );
                tokio::spawn(async move {
                    handle_connection(stream, ctx, keep_alive).await;
                });
            }
            Err(e) => {
                tracing::warn!("socketmap accept failed: {e}");
            }
        }
    }
}

/// Requests longer than this, measured after the query-type word, are
/// refused without even attempting to parse the rest.
const MAX_REQUEST_BODY: usize = 512;

async fn handle_connection<S>(mut stream: S, ctx: Context, keep_alive: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let store = ctx.open_store().await;
    let mut buf = Vec::new();
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        // Try to decode a frame already buffered before reading more.
        loop {
            match netstring::decode(&buf) {
                Ok((payload, consumed)) => {
                    let (response, keep_open) = handle_request(payload, &ctx, store.as_deref()).await;
                    let frame = netstring::encode(response.as_bytes());
                    if stream.write_all(&frame).await.is_err() || stream.flush().await.is_err() {
                        return;
                    }
                    buf.drain(..consumed);
                    if !keep_open {
                        return;
                    }
                    continue;
                }
                Err(NetstringError::Incomplete) => break,
                Err(e) => {
                    // A malformed frame is fatal to the connection: the
                    // reply is sent best-effort, then the socket is closed,
                    // since the stream position after a bad length prefix
                    // is no longer trustworthy.
                    tracing::warn!("malformed socketmap request: {e}");
                    let frame = netstring::encode(b"PERM Invalid query.");
                    let _ = stream.write_all(&frame).await;
                    return;
                }
            }
        }

        let read = match tokio::time::timeout(keep_alive, stream.read(&mut read_buf)).await {
            Ok(Ok(0)) | Err(_) => return,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return,
        };
        buf.extend_from_slice(&read_buf[..read]);
    }
}

/// Answers one request. The returned `bool` is `false` when the connection
/// must be closed after this response (an unknown query type), `true`
/// otherwise.
async fn handle_request(
    payload: &[u8],
    ctx: &Context,
    store: Option<&dyn store::AliasStore>,
) -> (String, bool) {
    let Ok(text) = std::str::from_utf8(payload) else {
        return ("PERM request was not valid utf-8".to_string(), false);
    };
    let Some((query_type, rest)) = text.split_once(' ') else {
        return ("PERM Invalid query.".to_string(), false);
    };
    if rest.len() > MAX_REQUEST_BODY {
        return ("PERM Too big.".to_string(), true);
    }
    let Some((_map_name, address)) = rest.split_once(' ') else {
        return ("PERM Invalid query.".to_string(), false);
    };

    let now = ctx.now();
    let result = match query_type {
        "forward" => {
            srs::policy::forward(
                address,
                &ctx.srs_domain,
                &ctx.srs,
                store,
                &ctx.local_domains,
                now,
            )
            .await
        }
        "reverse" => srs::policy::reverse(address, &ctx.srs, store, now).await,
        other => {
            tracing::warn!("unknown socketmap query type '{other}'");
            return ("PERM Invalid map.".to_string(), false);
        }
    };

    match result {
        Ok(Some(rewritten)) => {
            trc::log(
                trc::Level::Debug,
                trc::Event::RewriteForward {
                    sender: address.to_string(),
                    rewritten: rewritten.clone(),
                },
            );
            (format!("OK {rewritten}"), true)
        }
        Ok(None) => (format!("NOTFOUND {address} not rewritten"), true),
        Err(e) => {
            trc::log(
                trc::Level::Debug,
                trc::Event::RewriteRejected {
                    address: address.to_string(),
                    reason: e.to_string(),
                },
            );
            (format!("{} {e}", wire_class(&e)), true)
        }
    }
}

/// Classifies an [`srs::SrsError`] into the socketmap wire response class:
/// `TEMP` for a transient alias-store failure that might succeed on retry,
/// `PERM` for everything else (bad input, verification failure, disabled
/// rewriting).
fn wire_class(err: &srs::SrsError) -> &'static str {
    match err {
        srs::SrsError::StoreLookupFailed(_) => "TEMP",
        _ => "PERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use srs::{Secrets, Srs};
    use tokio::io::duplex;

    fn test_context() -> Context {
        Context {
            srs: Arc::new(Srs::new(Secrets::new(vec!["tops3cr3t".into()]))),
            srs_domain: Arc::from("example.com"),
            local_domains: Arc::new(srs::DomainTrie::new()),
            store_uri: None,
        }
    }

    #[tokio::test]
    async fn forward_request_round_trips_over_the_wire() {
        let ctx = test_context();
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(server, ctx, Duration::from_secs(5)));

        let request = netstring::encode(b"forward forward test@otherdomain.com");
        client.write_all(&request).await.unwrap();

        let mut response_buf = vec![0u8; 256];
        let n = client.read(&mut response_buf).await.unwrap();
        let (payload, _) = netstring::decode(&response_buf[..n]).unwrap();
        let response = std::str::from_utf8(payload).unwrap();
        assert!(response.starts_with("OK SRS0="));

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unknown_map_name_is_rejected() {
        let ctx = test_context();
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(server, ctx, Duration::from_secs(5)));

        let request = netstring::encode(b"query nosuchmap test@example.com");
        client.write_all(&request).await.unwrap();

        let mut response_buf = vec![0u8; 256];
        let n = client.read(&mut response_buf).await.unwrap();
        let (payload, _) = netstring::decode(&response_buf[..n]).unwrap();
        assert!(std::str::from_utf8(payload).unwrap().starts_with("PERM"));

        drop(client);
        let _ = handle.await;
    }
}
