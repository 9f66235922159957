//! End-to-end message layer.
//!
//! Each pair of mailboxes shares two keys derived from their published DH
//! values: one for the symmetric cipher and one for the MAC. The sender uses
//! the receiver's SEA and MAC specs so the receiver can open the message with
//! its own settings. The server only ever sees the sealed fields.
//!
//! Every non-empty field is `base64(ciphertext || tag)`. With an IV-based
//! mode, each field is encrypted under its own IV derived from the published
//! `cipherIV`.

use chrono::Utc;
use openssl::pkey::{PKey, Private};

use crate::crypto::{
    encoding, CryptoError, DhKeyPair, DhParams, HashAlgorithm, MacAlgorithm, Result, SeaSpec,
    SignatureAlgorithm,
};
use crate::protocol::MailboxRequest;
use crate::server::models::{message_bytes, receipt_bytes, secondary_data_bytes, Message, Receipt, User};

use super::attachments::{self, Attachment};

/// Digest applied to DH shared secrets.
const SHARED_SECRET_DIGEST: HashAlgorithm = HashAlgorithm::Sha256;

/// Format of receipt dates.
pub const RECEIPT_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

const TEXT_FIELD: u8 = 0;
const DESCRIPTOR_FIELD: u8 = 1;
const ATTACHMENTS_FIELD: u8 = 2;

/// The four secondary fields and their signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryData {
    pub dh_sea_pub_key: String,
    pub dh_mac_pub_key: String,
    pub sea_spec: String,
    pub mac_spec: String,
    pub signature: String,
}

impl SecondaryData {
    pub fn from_user(user: &User) -> Self {
        Self {
            dh_sea_pub_key: user.dh_sea_pub_key.clone(),
            dh_mac_pub_key: user.dh_mac_pub_key.clone(),
            sea_spec: user.sea_spec.clone(),
            mac_spec: user.mac_spec.clone(),
            signature: user.sec_data_signature.clone(),
        }
    }

    pub fn signed_bytes(&self) -> Vec<u8> {
        secondary_data_bytes(
            &self.dh_sea_pub_key,
            &self.dh_mac_pub_key,
            &self.sea_spec,
            &self.mac_spec,
        )
    }

    /// Check the signature under a base64 DER public key.
    pub fn verify(&self, public_key: &str, algorithm: SignatureAlgorithm) -> Result<()> {
        algorithm.require_valid(
            &self.signed_bytes(),
            &self.signature,
            &encoding::decode(public_key)?,
        )
    }

    pub fn into_create_request(self, uuid: impl Into<String>) -> MailboxRequest {
        MailboxRequest::Create {
            uuid: uuid.into(),
            dh_sea_pub_key: self.dh_sea_pub_key,
            dh_mac_pub_key: self.dh_mac_pub_key,
            sea_spec: self.sea_spec,
            mac_spec: self.mac_spec,
            sec_data_signature: self.signature,
        }
    }
}

/// Sealed fields ready for the `send` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub text: String,
    pub attachment_data: String,
    pub attachments: String,
    pub cipher_iv: Option<String>,
    pub sender_signature: String,
}

impl SealedMessage {
    pub fn into_send_request(self, sender_id: i64, receiver_id: i64) -> MailboxRequest {
        MailboxRequest::Send {
            sender_id,
            receiver_id,
            text: self.text,
            attachment_data: self.attachment_data,
            attachments: self.attachments,
            cipher_iv: self.cipher_iv,
            sender_signature: self.sender_signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// Keys shared with one other mailbox.
struct PairKeys {
    sea: SeaSpec,
    sea_key: Vec<u8>,
    mac: MacAlgorithm,
    mac_key: Vec<u8>,
}

impl PairKeys {
    fn field_iv(&self, iv: Option<&[u8]>, field: u8) -> Result<Option<Vec<u8>>> {
        match iv {
            None => Ok(None),
            Some(iv) => {
                let mut input = iv.to_vec();
                input.push(field);
                let digest = SHARED_SECRET_DIGEST.digest(&input)?;
                Ok(Some(digest[..self.sea.block_size()].to_vec()))
            }
        }
    }

    fn seal(&self, plain: &[u8], iv: Option<&[u8]>, field: u8) -> Result<String> {
        if plain.is_empty() {
            return Ok(String::new());
        }
        let iv = self.field_iv(iv, field)?;
        let mut sealed = self.sea.encrypt(plain, &self.sea_key, iv.as_deref())?;
        let tag = self.mac.mac_hash(&sealed, &self.mac_key)?;
        sealed.extend_from_slice(&tag);
        Ok(encoding::encode(&sealed))
    }

    fn open(&self, sealed: &str, iv: Option<&[u8]>, field: u8) -> Result<Vec<u8>> {
        if sealed.is_empty() {
            return Ok(Vec::new());
        }
        let bytes = encoding::decode(sealed)?;
        let tag_len = self.mac.output_len();
        if bytes.len() < tag_len {
            return Err(CryptoError::BadInput("Sealed field too short".to_string()));
        }
        let (ciphertext, tag) = bytes.split_at(bytes.len() - tag_len);
        if !self.mac.verify(ciphertext, tag, &self.mac_key)? {
            return Err(CryptoError::BadSignature("MAC does not verify".to_string()));
        }
        let iv = self.field_iv(iv, field)?;
        self.sea.decrypt(ciphertext, &self.sea_key, iv.as_deref())
    }
}

/// Long-term signing key plus the DH key pairs published in a mailbox.
pub struct LocalIdentity {
    signing_key: PKey<Private>,
    signature_algorithm: SignatureAlgorithm,
    dh_sea: DhKeyPair,
    dh_mac: DhKeyPair,
    sea_spec: SeaSpec,
    mac: MacAlgorithm,
}

impl LocalIdentity {
    /// Fresh DH key pairs in the server's group.
    pub fn generate(
        signing_key: PKey<Private>,
        params: &DhParams,
        sea_spec: SeaSpec,
        mac: MacAlgorithm,
        signature_algorithm: SignatureAlgorithm,
    ) -> Result<Self> {
        Ok(Self {
            signing_key,
            signature_algorithm,
            dh_sea: params.gen_key_pair()?,
            dh_mac: params.gen_key_pair()?,
            sea_spec,
            mac,
        })
    }

    /// Rebuild an identity from stored DH private values.
    pub fn restore(
        signing_key: PKey<Private>,
        params: &DhParams,
        dh_sea_private: &[u8],
        dh_mac_private: &[u8],
        sea_spec: SeaSpec,
        mac: MacAlgorithm,
        signature_algorithm: SignatureAlgorithm,
    ) -> Result<Self> {
        Ok(Self {
            signing_key,
            signature_algorithm,
            dh_sea: params.key_pair_from_private(dh_sea_private)?,
            dh_mac: params.key_pair_from_private(dh_mac_private)?,
            sea_spec,
            mac,
        })
    }

    /// `(sea, mac)` DH private values, for persisting the identity.
    pub fn dh_private_keys(&self) -> (Vec<u8>, Vec<u8>) {
        (self.dh_sea.private_key(), self.dh_mac.private_key())
    }

    pub fn secondary_data(&self) -> Result<SecondaryData> {
        let mut data = SecondaryData {
            dh_sea_pub_key: self.dh_sea.public_key_encoded(),
            dh_mac_pub_key: self.dh_mac.public_key_encoded(),
            sea_spec: self.sea_spec.to_string(),
            mac_spec: self.mac.to_string(),
            signature: String::new(),
        };
        data.signature = self
            .signature_algorithm
            .sign_encoded(&data.signed_bytes(), &self.signing_key)?;
        Ok(data)
    }

    fn pair_keys(&self, peer: &User, sea: SeaSpec, mac: MacAlgorithm) -> Result<PairKeys> {
        SecondaryData::from_user(peer).verify(&peer.public_key, self.signature_algorithm)?;
        let sea_secret = self
            .dh_sea
            .agree_and_digest(&encoding::decode(&peer.dh_sea_pub_key)?, SHARED_SECRET_DIGEST)?;
        let mac_key = self
            .dh_mac
            .agree_and_digest(&encoding::decode(&peer.dh_mac_pub_key)?, SHARED_SECRET_DIGEST)?;
        Ok(PairKeys {
            sea_key: sea.key_from_bytes(&sea_secret)?,
            sea,
            mac,
            mac_key,
        })
    }

    /// Encrypt, MAC and sign a message for `receiver`.
    pub fn seal_message(
        &self,
        receiver: &User,
        text: &str,
        files: &[Attachment],
    ) -> Result<SealedMessage> {
        let sea: SeaSpec = receiver.sea_spec.parse()?;
        let mac: MacAlgorithm = receiver.mac_spec.parse()?;
        let keys = self.pair_keys(receiver, sea, mac)?;

        let iv = if sea.cipher_mode_uses_iv() {
            Some(sea.generate_iv()?)
        } else {
            None
        };
        let (descriptor, packed) = attachments::pack(files);

        let text = keys.seal(text.as_bytes(), iv.as_deref(), TEXT_FIELD)?;
        let attachment_data = keys.seal(descriptor.as_bytes(), iv.as_deref(), DESCRIPTOR_FIELD)?;
        let attachments = keys.seal(&packed, iv.as_deref(), ATTACHMENTS_FIELD)?;
        let cipher_iv = iv.map(|iv| encoding::encode(&iv));

        let signed = message_bytes(&text, &attachment_data, &attachments, cipher_iv.as_deref());
        let sender_signature = self
            .signature_algorithm
            .sign_encoded(&signed, &self.signing_key)?;

        Ok(SealedMessage {
            text,
            attachment_data,
            attachments,
            cipher_iv,
            sender_signature,
        })
    }

    /// Verify the sender signature and MACs, then decrypt.
    pub fn open_message(&self, sender: &User, message: &Message) -> Result<OpenedMessage> {
        self.signature_algorithm.require_valid(
            &message.signed_bytes(),
            &message.sender_signature,
            &encoding::decode(&sender.public_key)?,
        )?;
        let keys = self.pair_keys(sender, self.sea_spec, self.mac)?;

        let iv = match (&message.cipher_iv, self.sea_spec.cipher_mode_uses_iv()) {
            (Some(iv), true) => Some(encoding::decode(iv)?),
            (None, false) => None,
            (None, true) => {
                return Err(CryptoError::BadInput("Message is missing its IV".to_string()))
            }
            (Some(_), false) => {
                return Err(CryptoError::BadInput(format!(
                    "{} does not take an IV",
                    self.sea_spec
                )))
            }
        };

        let text = keys.open(&message.text, iv.as_deref(), TEXT_FIELD)?;
        let text = String::from_utf8(text)
            .map_err(|_| CryptoError::BadInput("Message text is not UTF-8".to_string()))?;
        let descriptor = keys.open(&message.attachment_data, iv.as_deref(), DESCRIPTOR_FIELD)?;
        let descriptor = String::from_utf8(descriptor)
            .map_err(|_| CryptoError::BadInput("Attachment descriptor is not UTF-8".to_string()))?;
        let packed = keys.open(&message.attachments, iv.as_deref(), ATTACHMENTS_FIELD)?;
        let attachments = attachments::unpack(&descriptor, &packed)
            .map_err(|e| CryptoError::BadInput(e.to_string()))?;

        Ok(OpenedMessage { text, attachments })
    }

    /// Receipt signature over the message fields followed by `date`.
    pub fn sign_receipt(&self, message: &Message, date: &str) -> Result<String> {
        self.signature_algorithm
            .sign_encoded(&receipt_bytes(&message.signed_bytes(), date), &self.signing_key)
    }
}

/// The current time in receipt date format.
pub fn receipt_date() -> String {
    Utc::now().format(RECEIPT_DATE_FORMAT).to_string()
}

/// Check a receipt against the receiver's mailbox key.
pub fn verify_receipt(
    receipt: &Receipt,
    message: &Message,
    receiver: &User,
    algorithm: SignatureAlgorithm,
) -> Result<()> {
    algorithm.require_valid(
        &receipt_bytes(&message.signed_bytes(), &receipt.date),
        &receipt.receiver_signature,
        &encoding::decode(&receiver.public_key)?,
    )
}
