//! Presence fan-out: when a user logs in or out, every other account's
//! directory snapshot gets its matching contact entry flipped.

use log::{debug, warn};

use crate::models::PresenceStatus;
use crate::storage::DirectoryStore;

/// Rewrite the presence of `username` inside every other user's snapshot.
/// Snapshots without an entry for the user are left alone. A failure on one
/// file is logged and does not stop the sweep.
pub fn broadcast(directories: &DirectoryStore, username: &str, status: PresenceStatus) {
    for owner in directories.usernames() {
        if owner == username {
            continue;
        }
        let mut snapshot = directories.load(&owner);
        let Some(contact) = snapshot
            .contacts
            .iter_mut()
            .find(|c| c.name == username)
        else {
            continue;
        };
        if contact.status == status {
            continue;
        }
        contact.status = status;
        if let Err(e) = directories.save(&owner, snapshot) {
            warn!("presence update for {owner} failed: {e:#}");
        } else {
            debug!("marked {username} {status:?} in {owner}'s directory");
        }
    }
}
