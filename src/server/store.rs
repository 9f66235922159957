//! SQLite mailbox store: users, messages, receipts and the parameter map.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use crate::error::StoreError;

use super::models::{Message, NewMessage, NewUser, Receipt, User};

const USER_NOT_FOUND: &str = "User id not found";
const MESSAGE_NOT_FOUND: &str = "Message id not found";

const USER_COLUMNS: &str = "id, uuid, pubkey, dh_sea, dh_mac, sea_spec, mac_spec, sec_sig";
const MESSAGE_COLUMNS: &str =
    "id, sender, receiver, text, att_data, att_bytes, iv, sender_sig, read_flag";

/// Received and sent message ids of one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageIndex {
    /// `(id, read)` pairs.
    pub received: Vec<(i64, bool)>,
    pub sent: Vec<i64>,
}

pub struct MailboxStore {
    conn: Mutex<Connection>,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        uuid: row.get(1)?,
        public_key: row.get(2)?,
        dh_sea_pub_key: row.get(3)?,
        dh_mac_pub_key: row.get(4)?,
        sea_spec: row.get(5)?,
        mac_spec: row.get(6)?,
        sec_data_signature: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        text: row.get(3)?,
        attachment_data: row.get(4)?,
        attachments: row.get(5)?,
        cipher_iv: row.get(6)?,
        sender_signature: row.get(7)?,
        read: row.get(8)?,
    })
}

fn user_exists(conn: &Connection, id: i64) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn require_user(conn: &Connection, id: i64) -> Result<(), StoreError> {
    if user_exists(conn, id)? {
        Ok(())
    } else {
        Err(StoreError::NotFound(USER_NOT_FOUND.to_string()))
    }
}

fn require_message(tx: &Transaction<'_>, id: i64) -> Result<(), StoreError> {
    let found = tx
        .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    if found {
        Ok(())
    } else {
        Err(StoreError::NotFound(MESSAGE_NOT_FOUND.to_string()))
    }
}

impl MailboxStore {
    /// Open (or create) the database; `":memory:"` gives a private in-memory one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                pubkey TEXT NOT NULL,
                dh_sea TEXT NOT NULL,
                dh_mac TEXT NOT NULL,
                sea_spec TEXT NOT NULL,
                mac_spec TEXT NOT NULL,
                sec_sig TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender INTEGER NOT NULL REFERENCES users(id),
                receiver INTEGER NOT NULL REFERENCES users(id),
                text TEXT NOT NULL,
                att_data TEXT NOT NULL,
                att_bytes TEXT NOT NULL,
                iv TEXT,
                sender_sig TEXT NOT NULL,
                read_flag INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS receipts (
                message_id INTEGER NOT NULL REFERENCES messages(id),
                date TEXT NOT NULL,
                sig TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS params (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(MailboxStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a mailbox and return its id. The uuid check and the insert run
    /// in one transaction.
    pub fn insert_user(&self, user: &NewUser) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let taken = tx
            .query_row(
                "SELECT 1 FROM users WHERE uuid = ?1",
                params![user.uuid],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            return Err(StoreError::Duplicate(
                "User ID already registered.".to_string(),
            ));
        }
        tx.execute(
            "INSERT INTO users (uuid, pubkey, dh_sea, dh_mac, sea_spec, mac_spec, sec_sig)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.uuid,
                user.public_key,
                user.dh_sea_pub_key,
                user.dh_mac_pub_key,
                user.sea_spec,
                user.mac_spec,
                user.sec_data_signature
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn user(&self, id: i64) -> Result<User, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(USER_NOT_FOUND.to_string()))
    }

    pub fn users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Insert a message after checking both mailboxes exist.
    pub fn insert_message(&self, message: &NewMessage) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        require_user(&tx, message.sender_id)?;
        require_user(&tx, message.receiver_id)?;
        tx.execute(
            "INSERT INTO messages (sender, receiver, text, att_data, att_bytes, iv, sender_sig)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.sender_id,
                message.receiver_id,
                message.text,
                message.attachment_data,
                message.attachments,
                message.cipher_iv,
                message.sender_signature
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn message(&self, id: i64) -> Result<Message, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                message_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(MESSAGE_NOT_FOUND.to_string()))
    }

    /// Ids of messages received by `user_id` and not yet read.
    pub fn unread_ids(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        require_user(&conn, user_id)?;
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE receiver = ?1 AND read_flag = 0 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn message_index(&self, user_id: i64) -> Result<MessageIndex, StoreError> {
        let conn = self.conn();
        require_user(&conn, user_id)?;

        let mut stmt =
            conn.prepare("SELECT id, read_flag FROM messages WHERE receiver = ?1 ORDER BY id")?;
        let received = stmt
            .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(i64, bool)>>>()?;

        let mut stmt = conn.prepare("SELECT id FROM messages WHERE sender = ?1 ORDER BY id")?;
        let sent = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;

        Ok(MessageIndex { received, sent })
    }

    /// Insert a receipt and mark its message read as one unit of work.
    pub fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        require_message(&tx, receipt.message_id)?;
        tx.execute(
            "INSERT INTO receipts (message_id, date, sig) VALUES (?1, ?2, ?3)",
            params![receipt.message_id, receipt.date, receipt.receiver_signature],
        )
        .map_err(|e| {
            debug!("Receipt insert for message {} failed: {}", receipt.message_id, e);
            StoreError::NotFound(MESSAGE_NOT_FOUND.to_string())
        })?;
        tx.execute(
            "UPDATE messages SET read_flag = 1 WHERE id = ?1",
            params![receipt.message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn receipts(&self, message_id: i64) -> Result<Vec<Receipt>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message_id, date, sig FROM receipts WHERE message_id = ?1 ORDER BY rowid",
        )?;
        let receipts = stmt
            .query_map(params![message_id], |row| {
                Ok(Receipt {
                    message_id: row.get(0)?,
                    date: row.get(1)?,
                    receiver_signature: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(receipts)
    }

    pub fn params(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM params")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
        Ok(entries)
    }

    /// Write parameters; existing keys are replaced.
    pub fn put_params(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO params (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
