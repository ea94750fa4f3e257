use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One registered account in the server's user list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Account {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub pass_hash: String,
    pub created_at: i64,
    /// `host:port` of the user's peer listener while logged in, else empty.
    #[serde(default)]
    pub address: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// One entry in a user's directory snapshot. `local_id` is a display index
/// re-derived on every save; lookups must go through `name`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContactEntry {
    #[serde(rename = "id")]
    pub local_id: u32,
    pub name: String,
    pub status: PresenceStatus,
    pub preview: String,
    #[serde(rename = "time")]
    pub last_contact_time: i64,
    pub address: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistorySender {
    /// Written by the owner of the file.
    User,
    /// Written by the contact.
    Contact,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub sender: HistorySender,
    pub content: String,
    /// `HH:MM` local time.
    pub time: String,
}

/// Messages exchanged with one contact on one day.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DayHistory {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub messages: Vec<HistoryEntry>,
}

/// One account's directory: contacts plus per-contact, date-grouped chat
/// history. Kept server-side and mirrored client-side as `data.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,
    /// Keyed by contact name.
    #[serde(default)]
    pub messages: HashMap<String, Vec<DayHistory>>,
}

impl DirectorySnapshot {
    pub fn contact_by_name(&self, name: &str) -> Option<&ContactEntry> {
        self.contacts.iter().find(|c| c.name == name)
    }

    /// Update an existing contact's address/preview/recency, or append a new
    /// offline entry. Ids are fixed up on the next `normalize`.
    pub fn upsert_contact(&mut self, name: &str, address: &str, preview: &str, now: i64) {
        if let Some(contact) = self.contacts.iter_mut().find(|c| c.name == name) {
            contact.address = address.to_string();
            contact.preview = preview.to_string();
            contact.last_contact_time = now;
        } else {
            self.contacts.push(ContactEntry {
                local_id: 0,
                name: name.to_string(),
                status: PresenceStatus::Offline,
                preview: preview.to_string(),
                last_contact_time: now,
                address: address.to_string(),
            });
        }
    }

    /// Append one history line under the contact's group for `date`.
    pub fn append_history(
        &mut self,
        contact_name: &str,
        sender: HistorySender,
        content: &str,
        date: &str,
        time: &str,
    ) {
        let days = self.messages.entry(contact_name.to_string()).or_default();
        let entry = HistoryEntry {
            sender,
            content: content.to_string(),
            time: time.to_string(),
        };
        if let Some(day) = days.iter_mut().find(|d| d.date == date) {
            day.messages.push(entry);
        } else {
            days.push(DayHistory {
                date: date.to_string(),
                messages: vec![entry],
            });
        }
    }

    /// Fold a snapshot received from the server into this one. The server
    /// is authoritative for presence and addresses; chat state recorded
    /// locally since the last sync is kept. History day-groups already
    /// present locally win over the server's copy of the same date.
    pub fn merge_from_server(&mut self, server: DirectorySnapshot) {
        for remote in server.contacts {
            if let Some(local) = self.contacts.iter_mut().find(|c| c.name == remote.name) {
                local.status = remote.status;
                local.address = remote.address;
                if remote.last_contact_time > local.last_contact_time {
                    local.preview = remote.preview;
                    local.last_contact_time = remote.last_contact_time;
                }
            } else {
                self.contacts.push(remote);
            }
        }
        for (contact, remote_days) in server.messages {
            let days = self.messages.entry(contact).or_default();
            for remote_day in remote_days {
                if !days.iter().any(|d| d.date == remote_day.date) {
                    days.push(remote_day);
                }
            }
            days.sort_by(|a, b| a.date.cmp(&b.date));
        }
    }

    /// Sort contacts by recency and re-derive display ids from the sort
    /// order. Runs on every save; ids are not stable across saves.
    pub fn normalize(&mut self) {
        self.contacts
            .sort_by(|a, b| b.last_contact_time.cmp(&a.last_contact_time));
        for (i, contact) in self.contacts.iter_mut().enumerate() {
            contact.local_id = i as u32 + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_orders_by_recency_and_reindexes() {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.upsert_contact("old", "", "", 100);
        snapshot.upsert_contact("new", "", "", 300);
        snapshot.upsert_contact("mid", "", "", 200);
        snapshot.normalize();

        let names: Vec<&str> = snapshot.contacts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["new", "mid", "old"]);
        let ids: Vec<u32> = snapshot.contacts.iter().map(|c| c.local_id).collect();
        assert_eq!(ids, [1, 2, 3]);

        // Touching a contact changes the order, and ids follow the order.
        snapshot.upsert_contact("old", "", "hi again", 400);
        snapshot.normalize();
        assert_eq!(snapshot.contacts[0].name, "old");
        assert_eq!(snapshot.contacts[0].local_id, 1);
    }

    #[test]
    fn history_groups_by_date() {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.append_history("bob", HistorySender::User, "hi", "2026-08-23", "10:00");
        snapshot.append_history("bob", HistorySender::Contact, "hello", "2026-08-23", "10:01");
        snapshot.append_history("bob", HistorySender::User, "late", "2026-08-24", "09:00");

        let days = &snapshot.messages["bob"];
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].messages.len(), 2);
        assert_eq!(days[0].messages[1].sender, HistorySender::Contact);
        assert_eq!(days[1].date, "2026-08-24");
    }

    #[test]
    fn merge_takes_server_presence_and_keeps_local_chat_state() {
        let mut local = DirectorySnapshot::default();
        local.upsert_contact("bob", "", "me: hi", 500);
        local.append_history("bob", HistorySender::User, "hi", "2026-08-23", "10:00");

        let mut server = DirectorySnapshot::default();
        server.upsert_contact("bob", "10.0.0.2:9001", "", 100);
        server.contacts[0].status = PresenceStatus::Online;
        server.upsert_contact("carol", "10.0.0.3:9002", "hello", 200);
        server.append_history("bob", HistorySender::Contact, "old line", "2026-08-20", "09:00");
        server.append_history("bob", HistorySender::Contact, "lost", "2026-08-23", "08:00");

        local.merge_from_server(server);

        let bob = local.contact_by_name("bob").unwrap();
        assert_eq!(bob.status, PresenceStatus::Online);
        assert_eq!(bob.address, "10.0.0.2:9001");
        // Local entry is more recent; its preview and time survive.
        assert_eq!(bob.preview, "me: hi");
        assert_eq!(bob.last_contact_time, 500);
        assert!(local.contact_by_name("carol").is_some());

        let days = &local.messages["bob"];
        assert_eq!(days.len(), 2);
        // Server-only date added, local day-group for 2026-08-23 untouched.
        assert_eq!(days[0].date, "2026-08-20");
        assert_eq!(days[1].messages.len(), 1);
        assert_eq!(days[1].messages[0].content, "hi");
    }

    #[test]
    fn merge_with_empty_server_snapshot_changes_nothing() {
        let mut local = DirectorySnapshot::default();
        local.upsert_contact("bob", "", "hi", 10);
        local.append_history("bob", HistorySender::Contact, "hi", "2026-08-23", "10:00");
        let before = local.clone();

        local.merge_from_server(DirectorySnapshot::default());
        assert_eq!(local, before);
    }

    #[test]
    fn contact_entry_wire_field_names() {
        let entry = ContactEntry {
            local_id: 1,
            name: "bob".to_string(),
            status: PresenceStatus::Online,
            preview: "hi".to_string(),
            last_contact_time: 42,
            address: "127.0.0.1:9001".to_string(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["time"], 42);
        assert_eq!(value["status"], "online");
    }
}
