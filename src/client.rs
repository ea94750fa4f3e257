//! Client side of the server link: account transactions, directory sync and
//! the background resync task. All traffic on the connection runs under one
//! async mutex so the foreground and the resync never interleave frames.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{
    unix_now, ChatMessage, Envelope, FileKind, GetDirectory, GetPublicKey, Login, Logout,
    Register,
};
use crate::storage::ClientVault;
use crate::transfer::{await_start, receive};
use crate::wire::{read_frame, write_frame};

pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30);
const KEY_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Server verdict on a register or login.
#[derive(Debug, PartialEq, Eq)]
pub enum TxnOutcome {
    Accepted { user_id: String },
    Rejected { error_type: String },
}

/// Read the next transaction reply. A public-key push that arrived after
/// its request timed out leaves transfer frames queued on the connection;
/// those are drained and dropped here instead of failing the transaction.
async fn read_reply<S>(conn: &mut S) -> Result<Envelope, crate::wire::WireError>
where
    S: AsyncRead + Unpin,
{
    loop {
        match read_frame(conn).await? {
            Envelope::StartTransfer(start) => {
                warn!("discarding late transfer {}", start.transfer_id);
            }
            Envelope::DataChunk(_) | Envelope::EndTransfer(_) => {}
            other => return Ok(other),
        }
    }
}

pub async fn register<S>(
    conn: &mut S,
    username: &str,
    secret: &str,
    email: &str,
) -> Result<TxnOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::Register(Register {
            username: username.to_string(),
            secret: secret.to_string(),
            email: email.to_string(),
            time: unix_now(),
        }),
    )
    .await?;
    match read_reply(conn).await? {
        Envelope::SuccessRegister(ok) => Ok(TxnOutcome::Accepted { user_id: ok.user_id }),
        Envelope::FailRegister(fail) => Ok(TxnOutcome::Rejected {
            error_type: fail.error_type,
        }),
        other => bail!("unexpected reply tag {} to register", other.tag()),
    }
}

/// Log in and store the snapshot the server pushes on success.
pub async fn login<S>(
    conn: &mut S,
    vault: &ClientVault,
    secret: &str,
    listen_port: u16,
) -> Result<TxnOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::Login(Login {
            username: vault.username().to_string(),
            secret: secret.to_string(),
            listen_port,
            time: unix_now(),
        }),
    )
    .await?;
    match read_reply(conn).await? {
        Envelope::SuccessLogin(ok) => {
            let start = await_start(conn, Some(&ok.transfer_id)).await?;
            match receive(conn, &start).await? {
                Some(completed) => completed.persist(vault)?,
                None => warn!("login snapshot transfer was cancelled; keeping local copy"),
            }
            info!("logged in as {} ({})", vault.username(), ok.user_id);
            Ok(TxnOutcome::Accepted { user_id: ok.user_id })
        }
        Envelope::FailLogin(fail) => Ok(TxnOutcome::Rejected {
            error_type: fail.error_type,
        }),
        other => bail!("unexpected reply tag {} to login", other.tag()),
    }
}

pub async fn logout<S>(conn: &mut S, vault: &ClientVault) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::Logout(Logout {
            username: vault.username().to_string(),
            time: unix_now(),
        }),
    )
    .await?;
    match read_reply(conn).await? {
        Envelope::SuccessLogout(_) => Ok(()),
        other => bail!("unexpected reply tag {} to logout", other.tag()),
    }
}

/// Pull a fresh snapshot and fold it into the local mirror.
pub async fn sync_directory<S>(conn: &mut S, vault: &ClientVault) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::GetDirectory(GetDirectory {
            username: vault.username().to_string(),
            time: unix_now(),
        }),
    )
    .await?;
    let start = await_start(conn, None).await?;
    match receive(conn, &start).await? {
        Some(completed) => completed.persist(vault)?,
        None => warn!("directory sync transfer was cancelled"),
    }
    Ok(())
}

/// Tell the server about a chat message so it can update both parties'
/// server-side directories. Fire-and-forget; the server sends no reply.
pub async fn report_message<S>(conn: &mut S, vault: &ClientVault, receiver: &str, content: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::Message(ChatMessage::new(vault.username(), receiver, content)),
    )
    .await?;
    Ok(())
}

/// Ask for a contact's certificate. The server stays silent when it has
/// none on file, so a missing reply within the timeout is `None`.
pub async fn request_public_key<S>(
    conn: &mut S,
    vault: &ClientVault,
    target: &str,
    timeout: Duration,
) -> Result<Option<PathBuf>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        conn,
        &Envelope::GetPublicKey(GetPublicKey {
            requester_name: vault.username().to_string(),
            target_name: target.to_string(),
            time: unix_now(),
        }),
    )
    .await?;
    let start = match tokio::time::timeout(timeout, await_start(conn, None)).await {
        Ok(start) => start?,
        Err(_) => {
            info!("no certificate on file for {target}");
            return Ok(None);
        }
    };
    match receive(conn, &start).await? {
        Some(completed) if completed.kind == FileKind::PublicKey => {
            let path = vault.store_media(completed.kind, &completed.file_name, &completed.data)?;
            Ok(Some(path))
        }
        Some(completed) => {
            // Not the reply we asked for; store it anyway via its sink.
            completed.persist(vault)?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Shared handle to the one server connection plus the local mirror.
pub struct ServerSession<S> {
    conn: Arc<Mutex<S>>,
    vault: Arc<ClientVault>,
}

impl<S> Clone for ServerSession<S> {
    fn clone(&self) -> Self {
        ServerSession {
            conn: Arc::clone(&self.conn),
            vault: Arc::clone(&self.vault),
        }
    }
}

impl<S> ServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn: S, vault: Arc<ClientVault>) -> Self {
        ServerSession {
            conn: Arc::new(Mutex::new(conn)),
            vault,
        }
    }

    pub fn vault(&self) -> &ClientVault {
        &self.vault
    }

    pub async fn register(&self, secret: &str, email: &str) -> Result<TxnOutcome> {
        let mut conn = self.conn.lock().await;
        register(&mut *conn, self.vault.username(), secret, email).await
    }

    pub async fn login(&self, secret: &str, listen_port: u16) -> Result<TxnOutcome> {
        let mut conn = self.conn.lock().await;
        login(&mut *conn, &self.vault, secret, listen_port).await
    }

    pub async fn logout(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        logout(&mut *conn, &self.vault).await
    }

    pub async fn report_message(&self, receiver: &str, content: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        report_message(&mut *conn, &self.vault, receiver, content).await
    }

    pub async fn sync_directory(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sync_directory(&mut *conn, &self.vault).await
    }

    pub async fn request_public_key(&self, target: &str) -> Result<Option<PathBuf>> {
        let mut conn = self.conn.lock().await;
        request_public_key(&mut *conn, &self.vault, target, KEY_REPLY_TIMEOUT).await
    }

    /// Periodic directory resync in the background. Send `true` on the
    /// returned channel to stop it.
    pub fn spawn_resync(&self, period: Duration) -> (watch::Sender<bool>, JoinHandle<()>) {
        let session = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so the
            // snapshot just received at login is not refetched at once.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = session.sync_directory().await {
                            warn!("directory resync failed: {e:#}");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        (shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DirectorySnapshot;
    use crate::protocol::{
        FailLogin, SuccessLogin, SuccessLogout, ERR_INCORRECT_SECRET,
    };
    use crate::transfer::send_blob;

    fn vault() -> (tempfile::TempDir, Arc<ClientVault>) {
        let dir = tempfile::tempdir().unwrap();
        let vault = ClientVault::new(dir.path(), "alice");
        vault.ensure_layout().unwrap();
        (dir, Arc::new(vault))
    }

    fn snapshot_with_bob() -> Vec<u8> {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.upsert_contact("bob", "10.0.0.2:9001", "hi", 7);
        serde_json::to_vec(&snapshot).unwrap()
    }

    #[tokio::test]
    async fn login_stores_pushed_snapshot() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        let server = tokio::spawn(async move {
            let Envelope::Login(req) = read_frame(&mut server_end).await.unwrap() else {
                panic!("expected Login");
            };
            assert_eq!(req.username, "alice");
            assert_eq!(req.listen_port, 9001);
            write_frame(
                &mut server_end,
                &Envelope::SuccessLogin(SuccessLogin {
                    username: req.username,
                    user_id: "uid-1".to_string(),
                    transfer_id: "t-login".to_string(),
                    time: 0,
                }),
            )
            .await
            .unwrap();
            send_blob(
                &mut server_end,
                "t-login",
                FileKind::Directory,
                "data.json",
                &snapshot_with_bob(),
            )
            .await
            .unwrap();
        });

        let outcome = session.login("pw1", 9001).await.unwrap();
        assert_eq!(
            outcome,
            TxnOutcome::Accepted {
                user_id: "uid-1".to_string()
            }
        );
        assert!(vault.load_snapshot().contact_by_name("bob").is_some());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_login_leaves_vault_alone() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        tokio::spawn(async move {
            read_frame(&mut server_end).await.unwrap();
            write_frame(
                &mut server_end,
                &Envelope::FailLogin(FailLogin {
                    username: "alice".to_string(),
                    error_type: ERR_INCORRECT_SECRET.to_string(),
                    time: 0,
                }),
            )
            .await
            .unwrap();
        });

        let outcome = session.login("wrong", 9001).await.unwrap();
        assert_eq!(
            outcome,
            TxnOutcome::Rejected {
                error_type: ERR_INCORRECT_SECRET.to_string()
            }
        );
        assert!(vault.load_snapshot().contacts.is_empty());
    }

    #[tokio::test]
    async fn sync_directory_folds_into_mirror() {
        let (_dir, vault) = vault();
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let Envelope::GetDirectory(req) = read_frame(&mut server_end).await.unwrap() else {
                panic!("expected GetDirectory");
            };
            assert_eq!(req.username, "alice");
            send_blob(
                &mut server_end,
                "t-sync",
                FileKind::Directory,
                "data.json",
                &snapshot_with_bob(),
            )
            .await
            .unwrap();
        });

        sync_directory(&mut client_end, &vault).await.unwrap();
        assert!(vault.load_snapshot().contact_by_name("bob").is_some());
    }

    #[tokio::test]
    async fn silent_public_key_request_times_out_to_none() {
        let (_dir, vault) = vault();
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            // Server has nothing on file: reads the request, says nothing.
            read_frame(&mut server_end).await.unwrap();
            std::mem::forget(server_end);
        });

        let got = request_public_key(
            &mut client_end,
            &vault,
            "ghost",
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn public_key_reply_lands_in_vault() {
        let (_dir, vault) = vault();
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            read_frame(&mut server_end).await.unwrap();
            send_blob(
                &mut server_end,
                "t-key",
                FileKind::PublicKey,
                "bob.pem",
                b"-----BEGIN CERTIFICATE-----",
            )
            .await
            .unwrap();
        });

        let path = request_public_key(
            &mut client_end,
            &vault,
            "bob",
            Duration::from_secs(1),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(path.ends_with("publickey/bob.pem"));
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn late_public_key_reply_does_not_break_the_session() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        let server = tokio::spawn(async move {
            // The key push arrives only after the requester gave up.
            read_frame(&mut server_end).await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
            send_blob(
                &mut server_end,
                "t-late",
                FileKind::PublicKey,
                "bob.pem",
                b"-----BEGIN CERTIFICATE-----",
            )
            .await
            .unwrap();
            let Envelope::Logout(req) = read_frame(&mut server_end).await.unwrap() else {
                panic!("expected Logout");
            };
            write_frame(
                &mut server_end,
                &Envelope::SuccessLogout(SuccessLogout {
                    username: req.username,
                    user_id: "uid-1".to_string(),
                    time: 0,
                }),
            )
            .await
            .unwrap();
        });

        {
            let mut conn = session.conn.lock().await;
            let got = request_public_key(&mut *conn, &vault, "bob", Duration::from_millis(10))
                .await
                .unwrap();
            assert!(got.is_none());
        }
        // The queued transfer frames are drained, not treated as the reply.
        session.logout().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn report_message_writes_one_fire_and_forget_frame() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        session.report_message("bob", "hi").await.unwrap();
        let Envelope::Message(msg) = read_frame(&mut server_end).await.unwrap() else {
            panic!("expected Message");
        };
        assert_eq!(msg.sender_name, "alice");
        assert_eq!(msg.receiver_name, "bob");
        assert_eq!(msg.content, "hi");
    }

    #[tokio::test]
    async fn resync_ticks_and_stops_on_shutdown() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        let server = tokio::spawn(async move {
            let mut served = 0u32;
            while let Ok(envelope) = read_frame(&mut server_end).await {
                assert!(matches!(envelope, Envelope::GetDirectory(_)));
                send_blob(
                    &mut server_end,
                    &format!("t-{served}"),
                    FileKind::Directory,
                    "data.json",
                    &snapshot_with_bob(),
                )
                .await
                .unwrap();
                served += 1;
            }
            served
        });

        let (shutdown, handle) = session.spawn_resync(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap();

        drop(session);
        let served = server.await.unwrap();
        assert!(served >= 2, "expected repeated syncs, got {served}");
        assert!(vault.load_snapshot().contact_by_name("bob").is_some());
    }

    #[tokio::test]
    async fn logout_roundtrip() {
        let (_dir, vault) = vault();
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(client_end, Arc::clone(&vault));

        tokio::spawn(async move {
            let Envelope::Logout(req) = read_frame(&mut server_end).await.unwrap() else {
                panic!("expected Logout");
            };
            write_frame(
                &mut server_end,
                &Envelope::SuccessLogout(SuccessLogout {
                    username: req.username,
                    user_id: "uid-1".to_string(),
                    time: 0,
                }),
            )
            .await
            .unwrap();
        });

        session.logout().await.unwrap();
    }
}
