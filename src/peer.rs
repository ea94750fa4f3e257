//! Peer-to-peer chat sessions: the inbound listener plus outbound
//! connections to contacts. Sessions talk the same framed protocol as the
//! server link but carry only chat messages and media transfers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::models::{HistorySender, PresenceStatus};
use crate::protocol::{ChatMessage, Envelope, FileKind};
use crate::storage::ClientVault;
use crate::tls;
use crate::transfer::{new_transfer_id, receive, send_file};
use crate::wire::{read_frame, write_frame, WireError};

/// What a session surfaces to the caller (printed by the binary).
#[derive(Debug)]
pub enum ChatEvent {
    Message { from: String, content: String },
    Media { from: String, kind: FileKind, path: PathBuf },
    SessionClosed { peer: String },
}

/// Everything a session task needs: the local mirror and the event channel.
pub struct SessionContext {
    pub vault: Arc<ClientVault>,
    pub events: mpsc::Sender<ChatEvent>,
}

/// Bind the peer listener; port 0 asks the OS for a free one.
pub async fn bind_listener(port: u16) -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding peer listener on port {port}"))?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Accept loop for inbound peer sessions, one task per connection.
pub async fn run_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    info!("peer listener on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match acceptor.accept(socket).await {
                Ok(stream) => {
                    if let Err(e) = handle_inbound_session(stream, ctx).await {
                        warn!("peer session from {peer} failed: {e:#}");
                    }
                }
                Err(e) => warn!("peer TLS handshake with {peer} failed: {e}"),
            }
        });
    }
}

/// Serve one inbound session. The first frame must be a chat message; it
/// identifies the peer, since the session has no login of its own.
pub async fn handle_inbound_session<S>(mut stream: S, ctx: Arc<SessionContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = match read_frame(&mut stream).await {
        Ok(Envelope::Message(msg)) => {
            let from = msg.sender_name.clone();
            info!("peer session opened by {from}");
            deliver_message(&ctx, &from, msg).await?;
            from
        }
        Ok(other) => bail!("peer session opened with message tag {}", other.tag()),
        Err(WireError::ConnectionClosed) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    session_loop(&mut stream, &peer, &ctx).await?;
    let _ = ctx
        .events
        .send(ChatEvent::SessionClosed { peer: peer.clone() })
        .await;
    info!("peer session with {peer} closed");
    Ok(())
}

/// Read messages and transfers from an identified peer until it hangs up.
async fn session_loop<R>(reader: &mut R, peer: &str, ctx: &SessionContext) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(reader).await {
            Ok(Envelope::Message(msg)) => {
                if msg.sender_name != peer {
                    warn!(
                        "ignoring message from {} on {peer}'s session",
                        msg.sender_name
                    );
                    continue;
                }
                deliver_message(ctx, peer, msg).await?
            }
            Ok(Envelope::StartTransfer(start)) => {
                match receive(reader, &start).await? {
                    Some(completed) => {
                        if completed.kind == FileKind::Directory {
                            warn!("{peer} sent a directory transfer on a peer session; dropped");
                            continue;
                        }
                        let path = ctx.vault.store_media(
                            completed.kind,
                            &completed.file_name,
                            &completed.data,
                        )?;
                        let _ = ctx
                            .events
                            .send(ChatEvent::Media {
                                from: peer.to_string(),
                                kind: completed.kind,
                                path,
                            })
                            .await;
                    }
                    None => warn!("transfer from {peer} cancelled"),
                }
            }
            Ok(other) => warn!("ignoring message tag {} from {peer}", other.tag()),
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn deliver_message(ctx: &SessionContext, peer: &str, msg: ChatMessage) -> Result<()> {
    ctx.vault
        .record_message(peer, HistorySender::Contact, &msg.content)?;
    let _ = ctx
        .events
        .send(ChatEvent::Message {
            from: peer.to_string(),
            content: msg.content,
        })
        .await;
    Ok(())
}

/// Where to dial a contact: it must exist in the snapshot, be online, and
/// have a published address.
pub fn contact_endpoint(vault: &ClientVault, contact_name: &str) -> Result<String> {
    let snapshot = vault.load_snapshot();
    let contact = snapshot
        .contact_by_name(contact_name)
        .with_context(|| format!("{contact_name} is not a contact"))?;
    anyhow::ensure!(
        contact.status == PresenceStatus::Online,
        "{contact_name} is offline"
    );
    anyhow::ensure!(
        !contact.address.is_empty(),
        "no address published for {contact_name}"
    );
    Ok(contact.address.clone())
}

enum Outbound {
    Message(String),
    File { kind: FileKind, path: PathBuf },
}

/// An outbound session to one contact. A single writer task owns the write
/// half and drains a channel; a reader task handles the contact's replies.
pub struct PeerChat {
    peer: String,
    outbound: mpsc::Sender<Outbound>,
}

impl PeerChat {
    /// Connect to a contact from the cached snapshot. The contact must be
    /// online with a published address.
    pub async fn connect(
        ctx: Arc<SessionContext>,
        connector: &TlsConnector,
        contact_name: &str,
    ) -> Result<PeerChat> {
        let address = contact_endpoint(&ctx.vault, contact_name)?;
        let stream: tokio_rustls::client::TlsStream<TcpStream> =
            tls::connect(connector, &address, contact_name).await?;
        info!("peer session to {contact_name} at {address}");
        Ok(PeerChat::start(stream, contact_name, ctx))
    }

    /// Wire up the reader and writer tasks over an established stream.
    pub fn start<S>(stream: S, contact_name: &str, ctx: Arc<SessionContext>) -> PeerChat
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(32);
        let peer = contact_name.to_string();

        let writer_ctx = Arc::clone(&ctx);
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let sent = match item {
                    Outbound::Message(content) => {
                        if let Err(e) = writer_ctx.vault.record_message(
                            &writer_peer,
                            HistorySender::User,
                            &content,
                        ) {
                            warn!("recording sent message failed: {e:#}");
                        }
                        let msg = ChatMessage::new(
                            writer_ctx.vault.username(),
                            &writer_peer,
                            &content,
                        );
                        write_frame(&mut write_half, &Envelope::Message(msg)).await
                    }
                    Outbound::File { kind, path } => {
                        send_file(&mut write_half, &new_transfer_id(), kind, &path)
                            .await
                            .map(|_| ())
                    }
                };
                if let Err(e) = sent {
                    warn!("send to {writer_peer} failed: {e}");
                    break;
                }
            }
        });

        let reader_peer = peer.clone();
        tokio::spawn(async move {
            let mut reader = read_half;
            if let Err(e) = session_loop(&mut reader, &reader_peer, &ctx).await {
                warn!("peer session with {reader_peer} failed: {e:#}");
            }
            let _ = ctx
                .events
                .send(ChatEvent::SessionClosed {
                    peer: reader_peer.clone(),
                })
                .await;
        });

        PeerChat {
            peer,
            outbound: outbound_tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        self.outbound
            .send(Outbound::Message(content.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("session with {} has ended", self.peer))
    }

    pub async fn send_file(&self, kind: FileKind, path: PathBuf) -> Result<()> {
        self.outbound
            .send(Outbound::File { kind, path })
            .await
            .map_err(|_| anyhow::anyhow!("session with {} has ended", self.peer))
    }
}
