use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenv::dotenv;
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use dirchat::client::{ServerSession, TxnOutcome, DEFAULT_RESYNC};
use dirchat::peer::{self, ChatEvent, PeerChat, SessionContext};
use dirchat::protocol::FileKind;
use dirchat::storage::ClientVault;
use dirchat::tls::TlsIdentity;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(username) = args.next() else {
        bail!("usage: dirchat-client <username> <secret> [email-to-register]");
    };
    let Some(secret) = args.next() else {
        bail!("usage: dirchat-client <username> <secret> [email-to-register]");
    };
    let register_email = args.next();

    let server_addr = env::var("DIRCHAT_ADDR").unwrap_or("127.0.0.1:47474".to_string());
    let user_dir = env::var("DIRCHAT_USER_DIR").unwrap_or("user".to_string());
    let resync = env::var("DIRCHAT_RESYNC_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RESYNC);
    let identity = TlsIdentity::new(
        env::var("DIRCHAT_CA").unwrap_or("certs/ca.pem".to_string()),
        env::var("DIRCHAT_CERT").unwrap_or(format!("certs/{username}.pem")),
        env::var("DIRCHAT_KEY").unwrap_or(format!("certs/{username}.key")),
    );

    let vault = Arc::new(ClientVault::new(&user_dir, &username));
    vault.ensure_layout()?;

    let connector = identity.connector()?;
    let acceptor = identity.acceptor()?;
    let (listener, listen_port) = peer::bind_listener(0).await?;

    let server_name = server_addr.split(':').next().unwrap_or("localhost");
    let conn = dirchat::tls::connect(&connector, &server_addr, server_name).await?;
    let session = ServerSession::new(conn, Arc::clone(&vault));

    if let Some(email) = register_email {
        match session.register(&secret, &email).await? {
            TxnOutcome::Accepted { user_id } => println!("Registered as {username} ({user_id})"),
            TxnOutcome::Rejected { error_type } => bail!("registration failed: {error_type}"),
        }
    }
    match session.login(&secret, listen_port).await? {
        TxnOutcome::Accepted { user_id } => println!("Logged in as {username} ({user_id})"),
        TxnOutcome::Rejected { error_type } => bail!("login failed: {error_type}"),
    }

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let ctx = Arc::new(SessionContext {
        vault: Arc::clone(&vault),
        events: events_tx,
    });

    let listener_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = peer::run_listener(listener, acceptor, listener_ctx).await {
            warn!("peer listener stopped: {e:#}");
        }
    });
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ChatEvent::Message { from, content } => println!("[{from}] {content}"),
                ChatEvent::Media { from, kind, path } => {
                    println!("[{from}] sent a {} -> {}", kind.as_str(), path.display())
                }
                ChatEvent::SessionClosed { peer } => println!("[{peer}] left the chat"),
            }
        }
    });

    let (resync_shutdown, resync_task) = session.spawn_resync(resync);

    println!("Commands: msg <contact> <text> | file <contact> <image|audio|file> <path> | key <contact> | sync | exit");
    let mut chats: HashMap<String, PeerChat> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["exit"] => break,
            ["sync"] => {
                if let Err(e) = session.sync_directory().await {
                    println!("sync failed: {e:#}");
                }
            }
            ["key", contact] => match session.request_public_key(contact).await {
                Ok(Some(path)) => println!("stored {}", path.display()),
                Ok(None) => println!("no certificate on file for {contact}"),
                Err(e) => println!("request failed: {e:#}"),
            },
            ["msg", contact, ..] => {
                let content = parts[2..].join(" ");
                match open_chat(&mut chats, &ctx, &connector, contact).await {
                    Ok(chat) => {
                        if let Err(e) = chat.send_message(&content).await {
                            println!("{e:#}");
                            chats.remove(*contact);
                        } else if let Err(e) = session.report_message(contact, &content).await {
                            warn!("reporting message to the server failed: {e:#}");
                        }
                    }
                    Err(e) => println!("{e:#}"),
                }
            }
            ["file", contact, kind, path] => {
                let Some(kind) = parse_kind(kind) else {
                    println!("file type must be image, audio or file");
                    continue;
                };
                match open_chat(&mut chats, &ctx, &connector, contact).await {
                    Ok(chat) => {
                        if let Err(e) = chat.send_file(kind, PathBuf::from(path)).await {
                            println!("{e:#}");
                            chats.remove(*contact);
                        }
                    }
                    Err(e) => println!("{e:#}"),
                }
            }
            _ => println!("unrecognized command"),
        }
    }

    resync_shutdown.send(true).ok();
    resync_task.await.ok();
    session.logout().await.context("logging out")?;
    println!("Logged out");
    Ok(())
}

async fn open_chat<'a>(
    chats: &'a mut HashMap<String, PeerChat>,
    ctx: &Arc<SessionContext>,
    connector: &tokio_rustls::TlsConnector,
    contact: &str,
) -> Result<&'a PeerChat> {
    if !chats.contains_key(contact) {
        let chat = PeerChat::connect(Arc::clone(ctx), connector, contact).await?;
        chats.insert(contact.to_string(), chat);
    }
    Ok(&chats[contact])
}

fn parse_kind(kind: &str) -> Option<FileKind> {
    match kind {
        "image" => Some(FileKind::Image),
        "audio" => Some(FileKind::Audio),
        "file" => Some(FileKind::File),
        _ => None,
    }
}
