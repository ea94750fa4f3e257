//! Flat-file JSON persistence. Every store is plain read-modify-write with
//! no atomicity across the read and the write; see DESIGN.md.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use log::warn;

use crate::models::{Account, DirectorySnapshot, HistorySender};
use crate::protocol::FileKind;

/// Server-side directory layout rooted at the data dir.
#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub data_dir: PathBuf,
}

impl ServerPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        ServerPaths {
            data_dir: data_dir.into(),
        }
    }

    pub fn users_file(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn directory_dir(&self) -> PathBuf {
        self.data_dir.join("directory")
    }

    pub fn publickey_dir(&self) -> PathBuf {
        self.data_dir.join("publickey")
    }

    pub fn publickey_file(&self, username: &str) -> PathBuf {
        self.publickey_dir().join(format!("{username}.pem"))
    }
}

/// The server's account list, backed by `users.json`.
pub struct AccountStore {
    path: PathBuf,
    accounts: Vec<Account>,
}

impl AccountStore {
    /// Load the user list. A missing or unparseable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let accounts = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!("could not parse {}: {e}; starting empty", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Ok(AccountStore { path, accounts })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, username: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.username == username)
    }

    pub fn insert(&mut self, account: Account) -> Result<()> {
        self.accounts.push(account);
        self.persist()
    }

    pub fn set_address(&mut self, username: &str, address: &str) -> Result<()> {
        if let Some(account) = self.accounts.iter_mut().find(|a| a.username == username) {
            account.address = address.to_string();
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.accounts)?;
        fs::write(&self.path, bytes)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// Server-side per-account directory snapshots, one JSON file per user.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStore { root: root.into() }
    }

    pub fn path_for(&self, username: &str) -> PathBuf {
        self.root.join(format!("{username}.json"))
    }

    /// Load a user's snapshot; missing or corrupt files read as empty.
    pub fn load(&self, username: &str) -> DirectorySnapshot {
        let path = self.path_for(username);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("could not parse {}: {e}; treating as empty", path.display());
                DirectorySnapshot::default()
            }),
            Err(_) => DirectorySnapshot::default(),
        }
    }

    /// Normalize (recency sort, re-derived ids) and write back.
    pub fn save(&self, username: &str, mut snapshot: DirectorySnapshot) -> Result<()> {
        snapshot.normalize();
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(username);
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
    }

    pub fn create_empty(&self, username: &str) -> Result<()> {
        self.save(username, DirectorySnapshot::default())
    }

    /// Serialized snapshot bytes as pushed over a transfer.
    pub fn snapshot_bytes(&self, username: &str) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.load(username))?)
    }

    /// Owners of every persisted snapshot (file stems under the root).
    pub fn usernames(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Client-side mirror for one logged-in user: `<root>/<username>/` holding
/// `data.json` plus the media subdirectories.
pub struct ClientVault {
    user_dir: PathBuf,
    username: String,
    // One in-process writer at a time for data.json.
    data_lock: Mutex<()>,
}

impl ClientVault {
    pub fn new(root: impl AsRef<Path>, username: &str) -> Self {
        ClientVault {
            user_dir: root.as_ref().join(username),
            username: username.to_string(),
            data_lock: Mutex::new(()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn data_path(&self) -> PathBuf {
        self.user_dir.join("data.json")
    }

    pub fn media_dir(&self, kind: FileKind) -> PathBuf {
        self.user_dir.join(kind.as_str())
    }

    /// Create the user directory, media subdirectories and an empty
    /// snapshot if none exists yet.
    pub fn ensure_layout(&self) -> Result<()> {
        for kind in [
            FileKind::Image,
            FileKind::Audio,
            FileKind::File,
            FileKind::PublicKey,
        ] {
            fs::create_dir_all(self.media_dir(kind))?;
        }
        if !self.data_path().exists() {
            self.write_snapshot(DirectorySnapshot::default())?;
        }
        Ok(())
    }

    pub fn load_snapshot(&self) -> DirectorySnapshot {
        match fs::read(self.data_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    "could not parse {}: {e}; treating as empty",
                    self.data_path().display()
                );
                DirectorySnapshot::default()
            }),
            Err(_) => DirectorySnapshot::default(),
        }
    }

    fn write_snapshot(&self, mut snapshot: DirectorySnapshot) -> Result<()> {
        snapshot.normalize();
        fs::create_dir_all(&self.user_dir)?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(self.data_path(), bytes)
            .with_context(|| format!("writing {}", self.data_path().display()))
    }

    /// Fold snapshot bytes received from the server into the local mirror.
    /// Contacts and history recorded locally since the last sync survive;
    /// the server's view of presence and addresses wins. An empty payload
    /// merges as an empty snapshot and leaves local state alone.
    pub fn apply_snapshot_bytes(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.data_lock.lock().unwrap_or_else(|e| e.into_inner());
        let server = if bytes.is_empty() {
            DirectorySnapshot::default()
        } else {
            serde_json::from_slice(bytes).context("parsing directory snapshot")?
        };
        let mut snapshot = self.load_snapshot();
        snapshot.merge_from_server(server);
        self.write_snapshot(snapshot)
    }

    /// Append one chat line (sent or received) and refresh the contact's
    /// preview and recency. Serialized against concurrent session writers.
    pub fn record_message(
        &self,
        contact_name: &str,
        sender: HistorySender,
        content: &str,
    ) -> Result<()> {
        let _guard = self.data_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = self.load_snapshot();
        let address = snapshot
            .contact_by_name(contact_name)
            .map(|c| c.address.clone())
            .unwrap_or_default();
        let preview = match sender {
            HistorySender::User => format!("me: {content}"),
            HistorySender::Contact => content.to_string(),
        };
        let now = Local::now();
        snapshot.upsert_contact(contact_name, &address, &preview, now.timestamp());
        snapshot.append_history(
            contact_name,
            sender,
            content,
            &now.format("%Y-%m-%d").to_string(),
            &now.format("%H:%M").to_string(),
        );
        self.write_snapshot(snapshot)
    }

    /// Write received media under the type-specific subdirectory.
    pub fn store_media(&self, kind: FileKind, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.media_dir(kind);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
