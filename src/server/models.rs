//! Mailbox records and the canonical byte strings that get signed.
//!
//! The same types are returned by the server and decoded by the client, so
//! their serde names are the wire names.

use serde::{Deserialize, Serialize};

/// A registered mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub uuid: String,
    /// Base64 SubjectPublicKeyInfo of the certificate that created the mailbox.
    pub public_key: String,
    pub dh_sea_pub_key: String,
    pub dh_mac_pub_key: String,
    pub sea_spec: String,
    pub mac_spec: String,
    pub sec_data_signature: String,
}

impl User {
    pub fn secondary_data_bytes(&self) -> Vec<u8> {
        secondary_data_bytes(
            &self.dh_sea_pub_key,
            &self.dh_mac_pub_key,
            &self.sea_spec,
            &self.mac_spec,
        )
    }
}

/// Mailbox fields supplied on `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub uuid: String,
    pub public_key: String,
    pub dh_sea_pub_key: String,
    pub dh_mac_pub_key: String,
    pub sea_spec: String,
    pub mac_spec: String,
    pub sec_data_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    #[serde(default)]
    pub attachment_data: String,
    #[serde(default)]
    pub attachments: String,
    #[serde(rename = "cipherIV", default, skip_serializing_if = "Option::is_none")]
    pub cipher_iv: Option<String>,
    pub sender_signature: String,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    pub fn signed_bytes(&self) -> Vec<u8> {
        message_bytes(
            &self.text,
            &self.attachment_data,
            &self.attachments,
            self.cipher_iv.as_deref(),
        )
    }
}

/// Message fields supplied on `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    pub attachment_data: String,
    pub attachments: String,
    pub cipher_iv: Option<String>,
    pub sender_signature: String,
}

impl NewMessage {
    pub fn signed_bytes(&self) -> Vec<u8> {
        message_bytes(
            &self.text,
            &self.attachment_data,
            &self.attachments,
            self.cipher_iv.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub message_id: i64,
    pub date: String,
    pub receiver_signature: String,
}

/// `dhSeaPubKey || dhMacPubKey || seaSpec || macSpec`
pub fn secondary_data_bytes(
    dh_sea_pub_key: &str,
    dh_mac_pub_key: &str,
    sea_spec: &str,
    mac_spec: &str,
) -> Vec<u8> {
    [dh_sea_pub_key, dh_mac_pub_key, sea_spec, mac_spec].concat().into_bytes()
}

/// `text || attachmentData || attachments || cipherIV`, absent fields empty.
pub fn message_bytes(
    text: &str,
    attachment_data: &str,
    attachments: &str,
    cipher_iv: Option<&str>,
) -> Vec<u8> {
    [text, attachment_data, attachments, cipher_iv.unwrap_or("")]
        .concat()
        .into_bytes()
}

/// The message bytes followed by the receipt date.
pub fn receipt_bytes(message: &[u8], date: &str) -> Vec<u8> {
    let mut bytes = message.to_vec();
    bytes.extend_from_slice(date.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_names() {
        let message = Message {
            id: 1,
            sender_id: 1,
            receiver_id: 2,
            text: "Y3Q=".to_string(),
            attachment_data: String::new(),
            attachments: String::new(),
            cipher_iv: None,
            sender_signature: "c2ln".to_string(),
            read: false,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["senderId"], 1);
        assert_eq!(value["senderSignature"], "c2ln");
        assert!(value.get("cipherIV").is_none());

        let decoded: Message = serde_json::from_value(json!({
            "id": 4, "senderId": 1, "receiverId": 2, "text": "",
            "cipherIV": "aXY=", "senderSignature": "", "read": true
        }))
        .unwrap();
        assert_eq!(decoded.cipher_iv.as_deref(), Some("aXY="));
        assert!(decoded.attachments.is_empty());
    }

    #[test]
    fn test_canonical_bytes() {
        assert_eq!(message_bytes("t", "", "", None), b"t");
        assert_eq!(message_bytes("t", "d", "a", Some("iv")), b"tdaiv");
        assert_eq!(receipt_bytes(b"tdaiv", "01/01/2024"), b"tdaiv01/01/2024");
        assert_eq!(
            secondary_data_bytes("AAAB", "AAAC", "AES/CBC/PKCS5", "HmacSHA256"),
            b"AAABAAACAES/CBC/PKCS5HmacSHA256"
        );
    }
}
