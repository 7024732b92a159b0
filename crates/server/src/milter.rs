//! A hand-rolled Sendmail milter wire adapter.
//!
//! No actively maintained pure-Rust milter crate could be grounded with
//! confidence from the retrieval pack, so this speaks the wire protocol
//! directly: a 4-byte big-endian length prefix, a 1-byte command code, and a
//! payload, framed the same way `utils::netstring` frames the socketmap
//! protocol. Only the commands this daemon actually needs are implemented -
//! everything else gets `SMFIR_CONTINUE` and is otherwise ignored, matching
//! the reference filter's `NULL` callback entries.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

use crate::context::Context;

// Command codes (SMFIC_*).
const SMFIC_OPTNEG: u8 = b'O';
const SMFIC_MAIL: u8 = b'M';
const SMFIC_RCPT: u8 = b'R';
const SMFIC_BODYEOB: u8 = b'E';
const SMFIC_ABORT: u8 = b'A';
const SMFIC_QUIT: u8 = b'Q';
const SMFIC_QUIT_NC: u8 = b'K';

// Response codes (SMFIR_*).
const SMFIR_CONTINUE: u8 = b'c';
const SMFIR_ADDRCPT: u8 = b'+';
const SMFIR_DELRCPT: u8 = b'-';
const SMFIR_CHGFROM: u8 = b'e';
const SMFIR_TEMPFAIL: u8 = b't';

// Action flags this filter declares during SMFIC_OPTNEG negotiation
// (SMFIF_CHGFROM | SMFIF_ADDRCPT | SMFIF_DELRCPT).
const ACTIONS: u32 = 0x40 | 0x04 | 0x08;
// Protocol version this adapter speaks.
const MILTER_VERSION: u32 = 6;
// Content flags: only ask to see the envelope sender and recipients, skip
// headers, body, and connection/HELO events entirely.
const SMFIP_NOCONNECT: u32 = 0x0001;
const SMFIP_NOHELO: u32 = 0x0002;
const SMFIP_NOHDRS: u32 = 0x0004;
const SMFIP_NOEOH: u32 = 0x0008;
const SMFIP_NOBODY: u32 = 0x0010;
const PROTOCOL_FLAGS: u32 =
    SMFIP_NOCONNECT | SMFIP_NOHELO | SMFIP_NOHDRS | SMFIP_NOEOH | SMFIP_NOBODY;

pub async fn serve_tcp(listener: TcpListener, ctx: Context) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                trc::log(
                    trc::Level::Info,
                    trc::Event::ConnectionAccepted {
                        endpoint: "milter".into(),
                        peer: peer.to_string(),
                    },
                );
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                });
            }
            Err(e) => tracing::warn!("milter accept failed: {e}"),
        }
    }
}

pub async fn serve_unix(listener: UnixListener, ctx: Context) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                trc::log(
                    trc::Level::Info,
                    trc::Event::ConnectionAccepted {
                        endpoint: "milter".into(),
                        peer: "unix".into(),
                    },
                );
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                });
            }
            Err(e) => tracing::warn!("milter accept failed: {e}"),
        }
    }
}

/// Per-message transient state, reset on `SMFIC_ABORT` and cleared again
/// once `SMFIC_BODYEOB` has answered it, mirroring `mlfiPriv` in the
/// reference filter.
#[derive(Default)]
struct Session {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

async fn handle_connection<S>(mut stream: S, ctx: Context)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::default();

    loop {
        let (cmd, payload) = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("milter frame read failed: {e}");
                return;
            }
        };

        match cmd {
            SMFIC_OPTNEG => {
                if write_optneg_reply(&mut stream).await.is_err() {
                    return;
                }
            }
            SMFIC_MAIL => {
                session.mail_from = first_arg(&payload).map(strip_brackets);
                if write_reply(&mut stream, SMFIR_CONTINUE, &[]).await.is_err() {
                    return;
                }
            }
            SMFIC_RCPT => {
                if let Some(addr) = first_arg(&payload) {
                    session.rcpt_to.push(strip_brackets(addr));
                }
                if write_reply(&mut stream, SMFIR_CONTINUE, &[]).await.is_err() {
                    return;
                }
            }
            SMFIC_BODYEOB => {
                // A fresh, short-lived store handle per `eom` call rather
                // than one held for the connection's lifetime - `eom` calls
                // are comparatively rare, unlike socketmap lookups.
                let store = ctx.open_store().await;
                if handle_eom(&mut stream, &ctx, store.as_deref(), &session)
                    .await
                    .is_err()
                {
                    return;
                }
                session = Session::default();
            }
            SMFIC_ABORT => {
                session = Session::default();
            }
            SMFIC_QUIT | SMFIC_QUIT_NC => return,
            _ => {
                if write_reply(&mut stream, SMFIR_CONTINUE, &[]).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Handles end-of-message: rewrites every captured recipient via `reverse`
/// (delete the original, add the rewritten form - milter has no single
/// "rename recipient" action) and the captured sender via `forward`, then
/// answers with one final status packet.
async fn handle_eom<S>(
    stream: &mut S,
    ctx: &Context,
    store: Option<&dyn store::AliasStore>,
    session: &Session,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let now = ctx.now();

    for recipient in &session.rcpt_to {
        match srs::policy::reverse(recipient, &ctx.srs, store, now).await {
            Ok(Some(original)) if &original != recipient => {
                trc::log(
                    trc::Level::Info,
                    trc::Event::RewriteReverse {
                        recipient: recipient.clone(),
                        rewritten: original.clone(),
                    },
                );
                let mut del_payload = recipient.clone().into_bytes();
                del_payload.push(0);
                write_reply(stream, SMFIR_DELRCPT, &del_payload).await?;
                let mut add_payload = original.into_bytes();
                add_payload.push(0);
                write_reply(stream, SMFIR_ADDRCPT, &add_payload).await?;
            }
            Ok(_) => {}
            Err(e) if is_store_failure(&e) => {
                trc::log(
                    trc::Level::Warn,
                    trc::Event::RewriteRejected {
                        address: recipient.clone(),
                        reason: e.to_string(),
                    },
                );
                return write_reply(stream, SMFIR_TEMPFAIL, &[]).await;
            }
            Err(e) => {
                // An ordinary codec verification failure (bad hash, expired
                // timestamp, malformed address...) leaves `*error = false`
                // in `postsrsd_reverse` - it is "not rewritten", not a
                // reason to tempfail the whole message.
                trc::log(
                    trc::Level::Info,
                    trc::Event::RewriteRejected {
                        address: recipient.clone(),
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    if let Some(sender) = session.mail_from.as_deref().filter(|s| !s.is_empty()) {
        match srs::policy::forward(
            sender,
            &ctx.srs_domain,
            &ctx.srs,
            store,
            &ctx.local_domains,
            now,
        )
        .await
        {
            Ok(Some(rewritten)) if rewritten != sender => {
                trc::log(
                    trc::Level::Info,
                    trc::Event::RewriteForward {
                        sender: sender.to_string(),
                        rewritten: rewritten.clone(),
                    },
                );
                let mut payload = rewritten.into_bytes();
                payload.push(0);
                write_reply(stream, SMFIR_CHGFROM, &payload).await?;
            }
            Ok(_) => {}
            Err(e) if is_store_failure(&e) => {
                trc::log(
                    trc::Level::Warn,
                    trc::Event::RewriteRejected {
                        address: sender.to_string(),
                        reason: e.to_string(),
                    },
                );
                return write_reply(stream, SMFIR_TEMPFAIL, &[]).await;
            }
            Err(e) => {
                // Same distinction as the recipient loop above: only a
                // store failure is worth tempfailing the message over.
                trc::log(
                    trc::Level::Info,
                    trc::Event::RewriteRejected {
                        address: sender.to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    write_reply(stream, SMFIR_CONTINUE, &[]).await
}

/// True for the two [`srs::SrsError`] variants that correspond to an alias
/// store that is missing or failed outright - `postsrsd_forward`/
/// `postsrsd_reverse` in the reference implementation set their `error`
/// flag (which `on_eom` maps to `SMFIS_TEMPFAIL`) only for "Database
/// error."/"Aliasing error." on the forward side and "No database for
/// alias." on the reverse side. Every other `SrsError` - a bad hash, a
/// stale timestamp, a malformed address, an alias key the store doesn't
/// recognize - leaves `*error = false` there and is just "not rewritten",
/// matching `socketmap.rs`'s `wire_class` PERM/TEMP split for the same
/// error set.
fn is_store_failure(err: &srs::SrsError) -> bool {
    matches!(
        err,
        srs::SrsError::StoreLookupFailed(_) | srs::SrsError::NoDatabaseForAlias
    )
}

fn first_arg(payload: &[u8]) -> Option<&str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).ok().filter(|s| !s.is_empty())
}

fn strip_brackets(addr: &str) -> String {
    addr.trim_start_matches('<').trim_end_matches('>').to_string()
}

async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let cmd = body[0];
    Ok(Some((cmd, body[1..].to_vec())))
}

async fn write_reply<S>(stream: &mut S, cmd: u8, payload: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = (payload.len() + 1) as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&[cmd]).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn write_optneg_reply<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&MILTER_VERSION.to_be_bytes());
    payload.extend_from_slice(&ACTIONS.to_be_bytes());
    payload.extend_from_slice(&PROTOCOL_FLAGS.to_be_bytes());
    write_reply(stream, SMFIC_OPTNEG, &payload).await
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

    fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = (payload.len() + 1) as u32;
        out.extend_from_slice(&len.to_be_bytes());
        out.push(cmd);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn optneg_then_mail_then_eom_rewrites_sender() {
        let ctx = test_context();
        let (mut client, server) = duplex(8192);
        let handle = tokio::spawn(handle_connection(server, ctx));

        let mut optneg_payload = Vec::new();
        optneg_payload.extend_from_slice(&6u32.to_be_bytes());
        optneg_payload.extend_from_slice(&0u32.to_be_bytes());
        optneg_payload.extend_from_slice(&0u32.to_be_bytes());
        client.write_all(&frame(SMFIC_OPTNEG, &optneg_payload)).await.unwrap();

        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIC_OPTNEG);

        let mut mail_payload = b"<test@otherdomain.com>".to_vec();
        mail_payload.push(0);
        client.write_all(&frame(SMFIC_MAIL, &mail_payload)).await.unwrap();
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIR_CONTINUE);

        client.write_all(&frame(SMFIC_BODYEOB, &[])).await.unwrap();
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIR_CHGFROM);
        let new_addr = std::str::from_utf8(&reply[1..reply.len() - 1]).unwrap();
        assert!(new_addr.starts_with("SRS0="));

        // the final status packet that terminates eom handling.
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIR_CONTINUE);

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn quit_closes_the_connection() {
        let ctx = test_context();
        let (mut client, server) = duplex(1024);
        let handle = tokio::spawn(handle_connection(server, ctx));
        client.write_all(&frame(SMFIC_QUIT, &[])).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_tampered_recipient_is_left_unrewritten_instead_of_tempfailing() {
        // A bad hash is an ordinary codec verification failure
        // (`SrsError::WrongHash`), not a store failure - it must pass the
        // message through untouched rather than tempfail it.
        let ctx = test_context();
        let (mut client, server) = duplex(8192);
        let handle = tokio::spawn(handle_connection(server, ctx));

        // consume the OPTNEG reply first.
        client.write_all(&frame(SMFIC_OPTNEG, &[0; 12])).await.unwrap();
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        client.read_exact(&mut vec![0u8; len]).await.unwrap();

        let tampered = "<SRS0=xxxx=2W=otherdomain.com=test@example.com>";
        let mut rcpt_payload = tampered.as_bytes().to_vec();
        rcpt_payload.push(0);
        client.write_all(&frame(SMFIC_RCPT, &rcpt_payload)).await.unwrap();
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIR_CONTINUE);

        client.write_all(&frame(SMFIC_BODYEOB, &[])).await.unwrap();
        // the only reply to eom is the final status packet: no DELRCPT,
        // no ADDRCPT, and - the point of this test - no TEMPFAIL either.
        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let len = u32::from_be_bytes(reply_len) as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SMFIR_CONTINUE);

        drop(client);
        let _ = handle.await;
    }

    #[test]
    fn only_store_failures_are_tempfail_worthy() {
        assert!(is_store_failure(&srs::SrsError::StoreLookupFailed(
            "boom".into()
        )));
        assert!(is_store_failure(&srs::SrsError::NoDatabaseForAlias));
        assert!(!is_store_failure(&srs::SrsError::WrongHash));
        assert!(!is_store_failure(&srs::SrsError::TimestampOutOfDate));
        assert!(!is_store_failure(&srs::SrsError::StoreKeyNotFound));
        assert!(!is_store_failure(&srs::SrsError::NotSrsAddress));
    }
}
