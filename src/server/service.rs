//! The message exchange request handler and server bootstrap.

use std::sync::Arc;
use std::time::Duration;

use openssl::x509::X509Ref;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::configs::ServerConfig;
use crate::crypto::{encoding, extract_serial, public_key_der, DhParams, SignatureAlgorithm};
use crate::error::{ServiceError, StoreError};
use crate::keystore::{KeyStore, TrustStore};
use crate::protocol::{parse_request, MailboxRequest, Payload, Response, WireRequest};
use crate::tls;
use crate::transport::{ConnectionSettings, RequestHandler, Server};

use super::models::{receipt_bytes, secondary_data_bytes, NewMessage, NewUser, Receipt};
use super::params::ServerParams;
use super::pki_link::PkiLink;
use super::store::MailboxStore;

/// Largest DH public value accepted on `create`, in bytes.
const MAX_DH_KEY_BYTES: usize = 2048;

/// The authenticated principal of one connection.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub serial: u64,
    /// DER SubjectPublicKeyInfo of the peer certificate.
    pub public_key_der: Vec<u8>,
    /// Base64 of `public_key_der`, as stored for mailboxes.
    pub public_key: String,
}

impl PeerIdentity {
    pub fn from_certificate(cert: &X509Ref) -> Result<Self, ServiceError> {
        let serial = extract_serial(cert).map_err(|e| {
            ServiceError::AuthorisationFailed(format!("Unusable peer certificate: {}", e))
        })?;
        let public_key_der = public_key_der(cert).map_err(|e| {
            ServiceError::AuthorisationFailed(format!("Unusable peer certificate: {}", e))
        })?;
        Ok(Self {
            serial,
            public_key: encoding::encode(&public_key_der),
            public_key_der,
        })
    }
}

pub struct MailboxService {
    store: Arc<MailboxStore>,
    params: ServerParams,
    signature_algorithm: SignatureAlgorithm,
    pki: Option<PkiLink>,
}

impl MailboxService {
    pub fn new(
        store: Arc<MailboxStore>,
        params: ServerParams,
        signature_algorithm: SignatureAlgorithm,
        pki: Option<PkiLink>,
    ) -> Self {
        Self {
            store,
            params,
            signature_algorithm,
            pki,
        }
    }

    pub fn store(&self) -> &Arc<MailboxStore> {
        &self.store
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    fn create(&self, peer: &PeerIdentity, user: NewUser) -> Result<i64, ServiceError> {
        if !self.params.accepts_sea_spec(&user.sea_spec) {
            return Err(ServiceError::InvalidFormat(format!(
                "Unsupported seaSpec: {}",
                user.sea_spec
            )));
        }
        if !self.params.accepts_mac_spec(&user.mac_spec) {
            return Err(ServiceError::InvalidFormat(format!(
                "Unsupported macSpec: {}",
                user.mac_spec
            )));
        }
        for key in [&user.dh_sea_pub_key, &user.dh_mac_pub_key] {
            if encoding::decode_bounded(key, MAX_DH_KEY_BYTES)?.is_empty() {
                return Err(ServiceError::InvalidFormat("Empty DH public key.".to_string()));
            }
        }

        let data = secondary_data_bytes(
            &user.dh_sea_pub_key,
            &user.dh_mac_pub_key,
            &user.sea_spec,
            &user.mac_spec,
        );
        self.signature_algorithm
            .require_valid(&data, &user.sec_data_signature, &peer.public_key_der)?;

        let id = self.store.insert_user(&user)?;
        info!("Created mailbox {} for certificate {}", id, peer.serial);
        Ok(id)
    }

    fn send(&self, peer: &PeerIdentity, message: NewMessage) -> Result<i64, ServiceError> {
        let mismatch =
            || ServiceError::AuthorisationFailed("Sender does not match the peer certificate.".to_string());
        let sender = match self.store.user(message.sender_id) {
            Ok(sender) => sender,
            Err(StoreError::NotFound(_)) => return Err(mismatch()),
            Err(e) => return Err(e.into()),
        };
        if sender.public_key != peer.public_key {
            return Err(mismatch());
        }
        self.store.user(message.receiver_id)?;

        self.signature_algorithm.require_valid(
            &message.signed_bytes(),
            &message.sender_signature,
            &peer.public_key_der,
        )?;

        let id = self.store.insert_message(&message)?;
        debug!("Stored message {} from {} to {}", id, message.sender_id, message.receiver_id);
        Ok(id)
    }

    fn receipt(&self, peer: &PeerIdentity, receipt: Receipt) -> Result<(), ServiceError> {
        let message = self.store.message(receipt.message_id)?;
        let receiver = self.store.user(message.receiver_id)?;
        if receiver.public_key != peer.public_key {
            return Err(ServiceError::AuthorisationFailed(
                "Only the receiver may acknowledge a message.".to_string(),
            ));
        }
        let data = receipt_bytes(&message.signed_bytes(), &receipt.date);
        self.signature_algorithm.require_valid(
            &data,
            &receipt.receiver_signature,
            &peer.public_key_der,
        )?;
        self.store.insert_receipt(&receipt)?;
        Ok(())
    }

    fn dispatch(
        &self,
        peer: &PeerIdentity,
        request: MailboxRequest,
    ) -> Result<Payload, ServiceError> {
        let mut payload = Payload::new();
        match request {
            MailboxRequest::Create {
                uuid,
                dh_sea_pub_key,
                dh_mac_pub_key,
                sea_spec,
                mac_spec,
                sec_data_signature,
            } => {
                let user = NewUser {
                    uuid,
                    public_key: peer.public_key.clone(),
                    dh_sea_pub_key,
                    dh_mac_pub_key,
                    sea_spec,
                    mac_spec,
                    sec_data_signature,
                };
                payload.insert("userId".to_string(), json!(self.create(peer, user)?));
            }
            MailboxRequest::List { user_id } => {
                // Ids below 1 never name a mailbox and list everyone.
                let users = match user_id {
                    Some(id) if id > 0 => vec![self.store.user(id)?],
                    _ => self.store.users()?,
                };
                payload.insert("users".to_string(), json!(users));
            }
            MailboxRequest::New { user_id } => {
                payload.insert(
                    "newMessageIds".to_string(),
                    json!(self.store.unread_ids(user_id)?),
                );
            }
            MailboxRequest::All { user_id } => {
                let index = self.store.message_index(user_id)?;
                let received: Vec<String> = index
                    .received
                    .iter()
                    .map(|(id, read)| {
                        if *read {
                            id.to_string()
                        } else {
                            format!("_{}", id)
                        }
                    })
                    .collect();
                payload.insert("receivedMessageIds".to_string(), json!(received));
                payload.insert("sentMessagesIds".to_string(), json!(index.sent));
            }
            MailboxRequest::Send {
                sender_id,
                receiver_id,
                text,
                attachment_data,
                attachments,
                cipher_iv,
                sender_signature,
            } => {
                let message = NewMessage {
                    sender_id,
                    receiver_id,
                    text,
                    attachment_data,
                    attachments,
                    cipher_iv,
                    sender_signature,
                };
                payload.insert("messageId".to_string(), json!(self.send(peer, message)?));
            }
            MailboxRequest::Receive { message_id } => {
                payload.insert("message".to_string(), json!(self.store.message(message_id)?));
            }
            MailboxRequest::Receipt {
                message_id,
                receiver_signature,
                date,
            } => {
                self.receipt(
                    peer,
                    Receipt {
                        message_id,
                        date,
                        receiver_signature,
                    },
                )?;
            }
            MailboxRequest::Status { message_id } => {
                let message = self.store.message(message_id)?;
                let receipts = self.store.receipts(message_id)?;
                payload.insert("message".to_string(), json!(message));
                payload.insert("receipts".to_string(), json!(receipts));
            }
            MailboxRequest::Params => {
                payload.insert("params".to_string(), json!(self.params));
            }
        }
        Ok(payload)
    }
}

impl RequestHandler for MailboxService {
    type Peer = PeerIdentity;

    fn authenticate(&self, peer: Option<&X509Ref>) -> Result<PeerIdentity, ServiceError> {
        let cert = peer.ok_or_else(|| {
            ServiceError::AuthorisationFailed("A client certificate is required.".to_string())
        })?;
        let identity = PeerIdentity::from_certificate(cert)?;
        if let Some(pki) = &self.pki {
            pki.ensure_not_revoked(identity.serial)?;
        }
        Ok(identity)
    }

    fn handle(&self, peer: &PeerIdentity, request: Value) -> Result<Response, ServiceError> {
        let envelope = parse_request::<MailboxRequest>(request)?;
        debug!("Request: {} made by {}", envelope.request.route(), peer.serial);
        let payload = self.dispatch(peer, envelope.request)?;
        Ok(Response::success(envelope.nonce, payload))
    }
}

/// Load key material, bootstrap parameters and bind the listener.
pub fn bind(config: &ServerConfig) -> Result<Server<MailboxService>, ServiceError> {
    let keystore = KeyStore::load(&config.keystore)?;
    let truststore = TrustStore::load(&config.truststore)?;
    let signature_algorithm: SignatureAlgorithm = config
        .signature_algorithm
        .parse()
        .map_err(|e| ServiceError::InvalidConfiguration(format!("{}", e)))?;

    let store = Arc::new(MailboxStore::open(&config.database)?);
    let dh_key_size = config.dh_key_size;
    let params = ServerParams::bootstrap(&store, &config.sea_specs, &config.mac_specs, || {
        DhParams::generate(dh_key_size)
    })?;
    let pki = PkiLink::from_config(&config.pki, &truststore, &config.tls)?;

    let acceptor = tls::build_acceptor(&keystore, Some(&truststore), &config.tls)?;
    let settings = ConnectionSettings {
        read_timeout: Duration::from_secs(config.read_timeout_secs),
        max_request_bytes: config.max_request_bytes(),
        debug: config.debug,
    };
    let service = MailboxService::new(store, params, signature_algorithm, pki);
    Server::bind(
        "server",
        (config.bind_address.as_str(), config.port),
        acceptor,
        service,
        config.threads,
        settings,
    )
}

/// Run the message server until the process is stopped.
pub fn run(config: &ServerConfig) -> Result<(), ServiceError> {
    config.validate()?;
    let server = bind(config)?;
    server.serve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::certificate::test_support::{leaf, rsa_key, self_signed};
    use openssl::pkey::{PKey, Private};

    struct Principal {
        key: PKey<Private>,
        peer: PeerIdentity,
    }

    fn principal(serial: u32) -> Principal {
        let ca_key = rsa_key();
        let ca = self_signed("Mailbox CA", &ca_key);
        let key = rsa_key();
        let cert = leaf("user", serial, &key, &ca_key, &ca);
        Principal {
            peer: PeerIdentity::from_certificate(&cert).unwrap(),
            key,
        }
    }

    fn service() -> MailboxService {
        let store = Arc::new(MailboxStore::open(":memory:").unwrap());
        let params = ServerParams::bootstrap(
            &store,
            &["AES/CBC/PKCS5".to_string(), "AES/ECB/PKCS5".to_string()],
            &["HmacSHA256".to_string()],
            DhParams::rfc5114_2048_256,
        )
        .unwrap();
        MailboxService::new(store, params, SignatureAlgorithm::default(), None)
    }

    fn sign(p: &Principal, data: &[u8]) -> String {
        SignatureAlgorithm::default().sign_encoded(data, &p.key).unwrap()
    }

    fn create_request(p: &Principal, uuid: &str) -> Value {
        json!({
            "type": "create",
            "uuid": uuid,
            "dhSeaPubKey": "AAAB",
            "dhMacPubKey": "AAAC",
            "seaSpec": "AES/CBC/PKCS5",
            "macSpec": "HmacSHA256",
            "secDataSignature": sign(p, b"AAABAAACAES/CBC/PKCS5HmacSHA256"),
            "nonce": "n1"
        })
    }

    fn send_request(p: &Principal, sender: i64, receiver: i64) -> Value {
        json!({
            "type": "send",
            "senderId": sender,
            "receiverId": receiver,
            "text": "Y2lwaGVy",
            "attachmentData": "",
            "attachments": "",
            "cipherIV": "aXY=",
            "senderSignature": sign(p, b"Y2lwaGVyaXY="),
            "nonce": "n3"
        })
    }

    #[test]
    fn test_create_binds_peer_key() {
        let service = service();
        let alice = principal(0x2A);

        let response = service.handle(&alice.peer, create_request(&alice, "u-1")).unwrap();
        assert_eq!(response.nonce.as_deref(), Some("n1"));
        assert_eq!(response.get::<i64>("userId").unwrap(), 1);
        assert_eq!(service.store().user(1).unwrap().public_key, alice.peer.public_key);

        let err = service
            .handle(&alice.peer, create_request(&alice, "u-1"))
            .unwrap_err();
        assert_eq!(err.status().code, 400);
        assert_eq!(err.public_message(), "User ID already registered.");
    }

    #[test]
    fn test_create_rejections() {
        let service = service();
        let alice = principal(1);
        let mallory = principal(2);

        // Signed by someone other than the peer.
        let err = service
            .handle(&mallory.peer, create_request(&alice, "u-1"))
            .unwrap_err();
        assert_eq!(err.status().code, 400);

        let mut request = create_request(&alice, "u-2");
        request["seaSpec"] = json!("AES/CTR/NoPadding");
        assert_eq!(service.handle(&alice.peer, request).unwrap_err().status().code, 400);

        let mut request = create_request(&alice, "u-3");
        request["dhSeaPubKey"] = json!("not base64!");
        assert_eq!(service.handle(&alice.peer, request).unwrap_err().status().code, 400);

        let mut request = create_request(&alice, "u-4");
        request.as_object_mut().unwrap().remove("nonce");
        assert!(matches!(
            service.handle(&alice.peer, request),
            Err(ServiceError::MissingValue(_))
        ));
        assert!(service.store().users().unwrap().is_empty());
    }

    #[test]
    fn test_send_receipt_flow() {
        let service = service();
        let alice = principal(1);
        let bob = principal(2);
        service.handle(&alice.peer, create_request(&alice, "a")).unwrap();
        service.handle(&bob.peer, create_request(&bob, "b")).unwrap();

        let response = service.handle(&alice.peer, send_request(&alice, 1, 2)).unwrap();
        assert_eq!(response.get::<i64>("messageId").unwrap(), 1);

        let response = service
            .handle(&bob.peer, json!({"type": "new", "userId": 2, "nonce": "x"}))
            .unwrap();
        assert_eq!(response.get::<Vec<i64>>("newMessageIds").unwrap(), vec![1]);

        let response = service
            .handle(&bob.peer, json!({"type": "all", "userId": 2, "nonce": "x"}))
            .unwrap();
        assert_eq!(
            response.get::<Vec<String>>("receivedMessageIds").unwrap(),
            vec!["_1"]
        );

        let date = "01/01/2024 00:00:00";
        let signature = sign(&bob, &receipt_bytes(b"Y2lwaGVyaXY=", date));
        // Only the receiver may acknowledge.
        let err = service
            .handle(
                &alice.peer,
                json!({"type": "receipt", "messageId": 1, "receiverSignature": signature, "date": date}),
            )
            .unwrap_err();
        assert_eq!(err.status().code, 403);

        let response = service
            .handle(
                &bob.peer,
                json!({"type": "receipt", "messageId": 1, "receiverSignature": signature, "date": date}),
            )
            .unwrap();
        assert!(response.is_success());
        assert!(response.nonce.is_none());

        let response = service
            .handle(&bob.peer, json!({"type": "new", "userId": 2, "nonce": "x"}))
            .unwrap();
        assert!(response.get::<Vec<i64>>("newMessageIds").unwrap().is_empty());

        let response = service
            .handle(&alice.peer, json!({"type": "status", "messageId": 1, "nonce": "s"}))
            .unwrap();
        assert_eq!(response.get::<Vec<Receipt>>("receipts").unwrap().len(), 1);
        assert!(response.payload["message"]["read"].as_bool().unwrap());

        let response = service
            .handle(&alice.peer, json!({"type": "all", "userId": 1, "nonce": "x"}))
            .unwrap();
        assert_eq!(response.get::<Vec<i64>>("sentMessagesIds").unwrap(), vec![1]);
    }

    #[test]
    fn test_send_identity_and_signature() {
        let service = service();
        let alice = principal(1);
        let bob = principal(2);
        service.handle(&alice.peer, create_request(&alice, "a")).unwrap();
        service.handle(&bob.peer, create_request(&bob, "b")).unwrap();

        // Bob claims to be user 1.
        let err = service.handle(&bob.peer, send_request(&bob, 1, 2)).unwrap_err();
        assert_eq!(err.status().code, 403);

        let err = service.handle(&alice.peer, send_request(&alice, 1, 9)).unwrap_err();
        assert_eq!(err.status().code, 404);

        let mut request = send_request(&alice, 1, 2);
        request["text"] = json!("dGFtcGVyZWQ=");
        assert_eq!(service.handle(&alice.peer, request).unwrap_err().status().code, 400);
        assert!(service.store().unread_ids(2).unwrap().is_empty());
    }

    #[test]
    fn test_receipt_for_missing_message() {
        let service = service();
        let bob = principal(2);
        let err = service
            .handle(
                &bob.peer,
                json!({"type": "receipt", "messageId": 5, "receiverSignature": "c2ln", "date": "d"}),
            )
            .unwrap_err();
        assert_eq!(err.status().code, 404);
        assert_eq!(err.public_message(), "Message id not found");
    }

    #[test]
    fn test_read_routes() {
        let service = service();
        let alice = principal(1);
        service.handle(&alice.peer, create_request(&alice, "a")).unwrap();

        let response = service
            .handle(&alice.peer, json!({"type": "list", "nonce": "l"}))
            .unwrap();
        assert_eq!(response.payload["users"][0]["uuid"], "a");

        let err = service
            .handle(&alice.peer, json!({"type": "list", "userId": 3, "nonce": "l"}))
            .unwrap_err();
        assert_eq!(err.public_message(), "User id not found");

        let bob = principal(2);
        service.handle(&bob.peer, create_request(&bob, "b")).unwrap();
        for id in [0, -1] {
            let response = service
                .handle(&alice.peer, json!({"type": "list", "userId": id, "nonce": "l"}))
                .unwrap();
            assert_eq!(response.payload["users"].as_array().unwrap().len(), 2);
        }

        let response = service
            .handle(&alice.peer, json!({"type": "params", "nonce": "p"}))
            .unwrap();
        let params: ServerParams = response.get("params").unwrap();
        assert_eq!(params.dh_key_size, 2048);
        assert_eq!(response.nonce.as_deref(), Some("p"));

        let err = service
            .handle(&alice.peer, json!({"type": "receive", "messageId": 1, "nonce": "r"}))
            .unwrap_err();
        assert_eq!(err.status().code, 404);
    }

    #[test]
    fn test_missing_peer_certificate() {
        let service = service();
        assert_eq!(service.authenticate(None).unwrap_err().status().code, 403);
    }
}
