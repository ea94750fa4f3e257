//! Directory server: accepts mutually-authenticated connections and serves
//! the account transactions. Each connection runs in its own task; all
//! shared state sits behind one async mutex.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use chrono::Local;

use crate::crypto::{hash_password, verify_password};
use crate::models::{Account, DirectorySnapshot, HistorySender, PresenceStatus};
use crate::presence;
use crate::protocol::{
    unix_now, ChatMessage, Envelope, FailLogin, FailRegister, FileKind, GetDirectory,
    GetPublicKey, Login, Logout, Register, SuccessLogin, SuccessLogout, SuccessRegister,
    ERR_INCORRECT_SECRET, ERR_USERNAME_EXISTS, ERR_USER_NOT_FOUND,
};
use crate::storage::{AccountStore, DirectoryStore, ServerPaths};
use crate::tls;
use crate::transfer::{new_transfer_id, send_blob};
use crate::wire::{read_frame, write_frame, WireError};

pub struct ServerState {
    pub paths: ServerPaths,
    pub accounts: AccountStore,
    pub directories: DirectoryStore,
    pub online: HashSet<String>,
}

pub struct Server {
    state: Arc<Mutex<ServerState>>,
}

impl Server {
    pub fn new(paths: ServerPaths) -> Result<Self> {
        let accounts = AccountStore::open(paths.users_file())?;
        let directories = DirectoryStore::new(paths.directory_dir());
        std::fs::create_dir_all(paths.publickey_dir())
            .with_context(|| format!("creating {}", paths.publickey_dir().display()))?;
        Ok(Server {
            state: Arc::new(Mutex::new(ServerState {
                paths,
                accounts,
                directories,
                online: HashSet::new(),
            })),
        })
    }

    pub fn state(&self) -> Arc<Mutex<ServerState>> {
        Arc::clone(&self.state)
    }

    pub async fn run(&self, addr: &str, acceptor: TlsAcceptor) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("directory server listening on {addr}");

        loop {
            let (socket, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let stream = match acceptor.accept(socket).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {peer} failed: {e}");
                        return;
                    }
                };
                let peer_cert = tls::peer_certificate_der(&stream);
                info!("connection from {peer}");
                if let Err(e) = handle_connection(stream, peer.ip(), peer_cert, state).await {
                    warn!("connection from {peer} ended with error: {e:#}");
                } else {
                    info!("connection from {peer} closed");
                }
            });
        }
    }
}

/// Serve one connection until the peer closes it. Generic over the stream so
/// the transaction logic runs over in-memory pipes in tests.
pub async fn handle_connection<S>(
    mut stream: S,
    peer_ip: IpAddr,
    peer_cert: Option<Vec<u8>>,
    state: Arc<Mutex<ServerState>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let envelope = match read_frame(&mut stream).await {
            Ok(envelope) => envelope,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match envelope {
            Envelope::Register(req) => {
                register(&mut stream, &state, peer_cert.as_deref(), req).await?
            }
            Envelope::Login(req) => login(&mut stream, &state, peer_ip, req).await?,
            Envelope::Logout(req) => logout(&mut stream, &state, req).await?,
            Envelope::GetDirectory(req) => get_directory(&mut stream, &state, req).await?,
            Envelope::GetPublicKey(req) => get_public_key(&mut stream, &state, req).await?,
            Envelope::Message(msg) => record_communication(&state, msg).await?,
            other => {
                warn!("unexpected message tag {} from {peer_ip}", other.tag());
            }
        }
    }
}

async fn register<S>(
    stream: &mut S,
    state: &Arc<Mutex<ServerState>>,
    peer_cert: Option<&[u8]>,
    req: Register,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = {
        let mut state = state.lock().await;
        if state.accounts.get(&req.username).is_some() {
            info!("register {}: username taken", req.username);
            Envelope::FailRegister(FailRegister {
                username: req.username,
                error_type: ERR_USERNAME_EXISTS.to_string(),
                time: unix_now(),
            })
        } else {
            let account = Account {
                user_id: Uuid::new_v4().to_string(),
                username: req.username.clone(),
                email: req.email,
                pass_hash: hash_password(&req.secret),
                created_at: unix_now(),
                address: String::new(),
            };
            let user_id = account.user_id.clone();
            state.accounts.insert(account)?;
            state.directories.create_empty(&req.username)?;
            if let Some(der) = peer_cert {
                let path = state.paths.publickey_file(&req.username);
                std::fs::write(&path, tls::pem_encode_certificate(der))
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            info!("registered {} ({user_id})", req.username);
            Envelope::SuccessRegister(SuccessRegister {
                username: req.username,
                user_id,
                time: unix_now(),
            })
        }
    };
    write_frame(stream, &reply).await?;
    Ok(())
}

async fn login<S>(
    stream: &mut S,
    state: &Arc<Mutex<ServerState>>,
    peer_ip: IpAddr,
    req: Login,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Authenticate and update shared state under the lock; the snapshot
    // bytes are captured there too, then pushed after the lock is gone.
    let outcome = {
        let mut state = state.lock().await;
        match state.accounts.get(&req.username) {
            None => Err(ERR_USER_NOT_FOUND),
            Some(account) if !verify_password(&req.secret, &account.pass_hash) => {
                Err(ERR_INCORRECT_SECRET)
            }
            Some(account) => {
                let user_id = account.user_id.clone();
                let address = format!("{peer_ip}:{}", req.listen_port);
                state.accounts.set_address(&req.username, &address)?;
                state.online.insert(req.username.clone());
                presence::broadcast(&state.directories, &req.username, PresenceStatus::Online);
                let snapshot = state.directories.snapshot_bytes(&req.username)?;
                Ok((user_id, snapshot))
            }
        }
    };

    match outcome {
        Err(error_type) => {
            info!("login {} failed: {error_type}", req.username);
            write_frame(
                stream,
                &Envelope::FailLogin(FailLogin {
                    username: req.username,
                    error_type: error_type.to_string(),
                    time: unix_now(),
                }),
            )
            .await?;
        }
        Ok((user_id, snapshot)) => {
            info!("login {} ({user_id})", req.username);
            let transfer_id = new_transfer_id();
            write_frame(
                stream,
                &Envelope::SuccessLogin(SuccessLogin {
                    username: req.username,
                    user_id,
                    transfer_id: transfer_id.clone(),
                    time: unix_now(),
                }),
            )
            .await?;
            send_blob(stream, &transfer_id, FileKind::Directory, "data.json", &snapshot).await?;
        }
    }
    Ok(())
}

async fn logout<S>(stream: &mut S, state: &Arc<Mutex<ServerState>>, req: Logout) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let user_id = {
        let mut state = state.lock().await;
        state.accounts.set_address(&req.username, "")?;
        state.online.remove(&req.username);
        presence::broadcast(&state.directories, &req.username, PresenceStatus::Offline);
        state
            .accounts
            .get(&req.username)
            .map(|a| a.user_id.clone())
            .unwrap_or_default()
    };
    info!("logout {}", req.username);
    write_frame(
        stream,
        &Envelope::SuccessLogout(SuccessLogout {
            username: req.username,
            user_id,
            time: unix_now(),
        }),
    )
    .await?;
    Ok(())
}

async fn get_directory<S>(
    stream: &mut S,
    state: &Arc<Mutex<ServerState>>,
    req: GetDirectory,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let snapshot = {
        let state = state.lock().await;
        state.directories.snapshot_bytes(&req.username)?
    };
    send_blob(
        stream,
        &new_transfer_id(),
        FileKind::Directory,
        "data.json",
        &snapshot,
    )
    .await?;
    Ok(())
}

/// A chat message reported by a client: refresh both parties' server-side
/// directories so the snapshots pushed at login reflect real traffic. No
/// reply is sent.
async fn record_communication(state: &Arc<Mutex<ServerState>>, msg: ChatMessage) -> Result<()> {
    let state = state.lock().await;
    let (Some(sender), Some(receiver)) = (
        state.accounts.get(&msg.sender_name).cloned(),
        state.accounts.get(&msg.receiver_name).cloned(),
    ) else {
        warn!(
            "dropping chat report between unknown accounts {} -> {}",
            msg.sender_name, msg.receiver_name
        );
        return Ok(());
    };
    let now = unix_now();
    let stamp = Local::now();
    let date = stamp.format("%Y-%m-%d").to_string();
    let time = stamp.format("%H:%M").to_string();

    let mut book = state.directories.load(&sender.username);
    book.upsert_contact(
        &receiver.username,
        &receiver.address,
        &format!("me: {}", msg.content),
        now,
    );
    mark_presence(&mut book, &receiver.username, state.online.contains(&receiver.username));
    book.append_history(&receiver.username, HistorySender::User, &msg.content, &date, &time);
    state.directories.save(&sender.username, book)?;

    let mut book = state.directories.load(&receiver.username);
    book.upsert_contact(&sender.username, &sender.address, &msg.content, now);
    mark_presence(&mut book, &sender.username, state.online.contains(&sender.username));
    book.append_history(&sender.username, HistorySender::Contact, &msg.content, &date, &time);
    state.directories.save(&receiver.username, book)?;
    Ok(())
}

fn mark_presence(book: &mut DirectorySnapshot, name: &str, online: bool) {
    if let Some(contact) = book.contacts.iter_mut().find(|c| c.name == name) {
        contact.status = if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
    }
}

async fn get_public_key<S>(
    stream: &mut S,
    state: &Arc<Mutex<ServerState>>,
    req: GetPublicKey,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let path = {
        let state = state.lock().await;
        state.paths.publickey_file(&req.target_name)
    };
    let file_name = format!("{}.pem", req.target_name);
    match std::fs::read(&path) {
        Ok(pem) => {
            info!(
                "sending {}'s certificate to {}",
                req.target_name, req.requester_name
            );
            send_blob(stream, &new_transfer_id(), FileKind::PublicKey, &file_name, &pem).await?;
        }
        Err(_) => {
            warn!(
                "no certificate on file for {} (asked by {})",
                req.target_name, req.requester_name
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{await_start, receive};

    const PEER_IP: &str = "203.0.113.7";

    fn spawn_server(
        data_dir: &std::path::Path,
        peer_cert: Option<Vec<u8>>,
    ) -> (tokio::io::DuplexStream, Arc<Mutex<ServerState>>) {
        let server = Server::new(ServerPaths::new(data_dir)).unwrap();
        let state = server.state();
        let (client, server_end) = tokio::io::duplex(256 * 1024);
        let conn_state = server.state();
        tokio::spawn(async move {
            handle_connection(server_end, PEER_IP.parse().unwrap(), peer_cert, conn_state)
                .await
                .unwrap();
        });
        (client, state)
    }

    fn register_msg(username: &str, secret: &str) -> Envelope {
        Envelope::Register(Register {
            username: username.to_string(),
            secret: secret.to_string(),
            email: format!("{username}@example.com"),
            time: unix_now(),
        })
    }

    fn login_msg(username: &str, secret: &str, listen_port: u16) -> Envelope {
        Envelope::Login(Login {
            username: username.to_string(),
            secret: secret.to_string(),
            listen_port,
            time: unix_now(),
        })
    }

    async fn receive_snapshot(
        conn: &mut tokio::io::DuplexStream,
        expected_id: Option<&str>,
    ) -> DirectorySnapshot {
        let start = await_start(conn, expected_id).await.unwrap();
        assert_eq!(start.file_type, FileKind::Directory);
        let completed = receive(conn, &start).await.unwrap().unwrap();
        serde_json::from_slice(&completed.data).unwrap()
    }

    #[tokio::test]
    async fn register_then_login_pushes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        let Envelope::SuccessRegister(ok) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected SuccessRegister");
        };
        assert_eq!(ok.username, "alice");

        write_frame(&mut conn, &login_msg("alice", "pw1", 9001))
            .await
            .unwrap();
        let Envelope::SuccessLogin(ok) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected SuccessLogin");
        };
        let snapshot = receive_snapshot(&mut conn, Some(&ok.transfer_id)).await;
        assert!(snapshot.contacts.is_empty());

        let state = state.lock().await;
        assert!(state.online.contains("alice"));
        assert_eq!(
            state.accounts.get("alice").unwrap().address,
            format!("{PEER_IP}:9001")
        );
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(&mut conn, &register_msg("alice", "other"))
            .await
            .unwrap();
        let Envelope::FailRegister(fail) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected FailRegister");
        };
        assert_eq!(fail.error_type, ERR_USERNAME_EXISTS);
        assert_eq!(state.lock().await.accounts.len(), 1);
    }

    #[tokio::test]
    async fn login_failures_name_the_cause() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &login_msg("ghost", "pw", 9001))
            .await
            .unwrap();
        let Envelope::FailLogin(fail) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected FailLogin");
        };
        assert_eq!(fail.error_type, ERR_USER_NOT_FOUND);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(&mut conn, &login_msg("alice", "wrong", 9001))
            .await
            .unwrap();
        let Envelope::FailLogin(fail) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected FailLogin");
        };
        assert_eq!(fail.error_type, ERR_INCORRECT_SECRET);
        assert!(!state.lock().await.online.contains("alice"));
    }

    #[tokio::test]
    async fn presence_sweeps_other_directories_on_login_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(&mut conn, &register_msg("bob", "pw2"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();

        // bob already has alice as a contact.
        {
            let state = state.lock().await;
            let mut snapshot = state.directories.load("bob");
            snapshot.upsert_contact("alice", "", "", 0);
            state.directories.save("bob", snapshot).unwrap();
        }

        write_frame(&mut conn, &login_msg("alice", "pw1", 9001))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        let start = await_start(&mut conn, None).await.unwrap();
        receive(&mut conn, &start).await.unwrap();
        {
            let state = state.lock().await;
            let bob = state.directories.load("bob");
            assert_eq!(
                bob.contact_by_name("alice").unwrap().status,
                PresenceStatus::Online
            );
        }

        write_frame(
            &mut conn,
            &Envelope::Logout(Logout {
                username: "alice".to_string(),
                time: unix_now(),
            }),
        )
        .await
        .unwrap();
        let Envelope::SuccessLogout(_) = read_frame(&mut conn).await.unwrap() else {
            panic!("expected SuccessLogout");
        };
        let state = state.lock().await;
        assert!(!state.online.contains("alice"));
        assert_eq!(state.accounts.get("alice").unwrap().address, "");
        assert_eq!(
            state.directories.load("bob").contact_by_name("alice").unwrap().status,
            PresenceStatus::Offline
        );
    }

    #[tokio::test]
    async fn register_stores_presented_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let der = vec![0x30, 0x82, 0x01, 0x0a];
        let (mut conn, state) = spawn_server(dir.path(), Some(der.clone()));

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();

        let path = state.lock().await.paths.publickey_file("alice");
        let pem = std::fs::read_to_string(path).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        // The certificate round-trips through GetPublicKey.
        write_frame(
            &mut conn,
            &Envelope::GetPublicKey(GetPublicKey {
                requester_name: "bob".to_string(),
                target_name: "alice".to_string(),
                time: unix_now(),
            }),
        )
        .await
        .unwrap();
        let start = await_start(&mut conn, None).await.unwrap();
        assert_eq!(start.file_type, FileKind::PublicKey);
        assert_eq!(start.file_name, "alice.pem");
        let completed = receive(&mut conn, &start).await.unwrap().unwrap();
        assert_eq!(completed.data, pem.as_bytes());
    }

    #[tokio::test]
    async fn get_directory_repushes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        {
            let state = state.lock().await;
            let mut snapshot = state.directories.load("alice");
            snapshot.upsert_contact("bob", "10.0.0.2:9001", "hi", 7);
            state.directories.save("alice", snapshot).unwrap();
        }

        write_frame(
            &mut conn,
            &Envelope::GetDirectory(GetDirectory {
                username: "alice".to_string(),
                time: unix_now(),
            }),
        )
        .await
        .unwrap();
        let snapshot = receive_snapshot(&mut conn, None).await;
        assert!(snapshot.contact_by_name("bob").is_some());
    }

    #[tokio::test]
    async fn reported_chat_populates_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(&mut conn, &register_msg("bob", "pw2"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(&mut conn, &login_msg("alice", "pw1", 9001))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        let start = await_start(&mut conn, None).await.unwrap();
        receive(&mut conn, &start).await.unwrap();

        write_frame(
            &mut conn,
            &Envelope::Message(ChatMessage::new("alice", "bob", "hi")),
        )
        .await
        .unwrap();
        // The report has no reply; a directory fetch serializes behind it.
        write_frame(
            &mut conn,
            &Envelope::GetDirectory(GetDirectory {
                username: "alice".to_string(),
                time: unix_now(),
            }),
        )
        .await
        .unwrap();
        let alice_book = receive_snapshot(&mut conn, None).await;
        let bob_entry = alice_book.contact_by_name("bob").unwrap();
        assert_eq!(bob_entry.preview, "me: hi");
        assert_eq!(bob_entry.status, PresenceStatus::Offline);
        assert_eq!(alice_book.messages["bob"][0].messages[0].sender, HistorySender::User);

        let state = state.lock().await;
        let bob_book = state.directories.load("bob");
        let alice_entry = bob_book.contact_by_name("alice").unwrap();
        assert_eq!(alice_entry.preview, "hi");
        assert_eq!(alice_entry.status, PresenceStatus::Online);
        assert_eq!(alice_entry.address, format!("{PEER_IP}:9001"));
        assert_eq!(
            bob_book.messages["alice"][0].messages[0].sender,
            HistorySender::Contact
        );
    }

    #[tokio::test]
    async fn unknown_parties_in_a_chat_report_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, state) = spawn_server(dir.path(), None);

        write_frame(&mut conn, &register_msg("alice", "pw1"))
            .await
            .unwrap();
        read_frame(&mut conn).await.unwrap();
        write_frame(
            &mut conn,
            &Envelope::Message(ChatMessage::new("alice", "ghost", "hi")),
        )
        .await
        .unwrap();
        // Still serving, and alice's book gained nothing.
        write_frame(
            &mut conn,
            &Envelope::GetDirectory(GetDirectory {
                username: "alice".to_string(),
                time: unix_now(),
            }),
        )
        .await
        .unwrap();
        let alice_book = receive_snapshot(&mut conn, None).await;
        assert!(alice_book.contacts.is_empty());
        assert!(state.lock().await.directories.load("ghost").contacts.is_empty());
    }
}
