//! Protocol Module
//!
//! Defines the JSON wire protocol shared by the PKI service, the message
//! server and the client library: request enums, the response envelope,
//! status codes and the bounded request reader.
//!
//! Every connection carries exactly one request followed by one response.
//! Values are raw UTF-8 JSON with no length prefix; the reader stops at the
//! end of the first complete JSON value.

use std::io::{self, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ServiceError;

/// Route-specific fields of a request or response.
pub type Payload = Map<String, Value>;

/// HTTP-style status carried by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::from_code(200)
    }

    pub fn from_code(code: u16) -> Self {
        let message = match code {
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            _ => "Unknown",
        };
        Self {
            code,
            message: message.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

/// Requests understood by the PKI service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PkiRequest {
    /// Issue a certificate for a base64 DER PKCS#10 request.
    Sign { csr: String },
    /// Revocation state of an issued serial.
    Check { serial: u64 },
}

/// Requests understood by the message server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MailboxRequest {
    #[serde(rename_all = "camelCase")]
    Create {
        uuid: String,
        dh_sea_pub_key: String,
        dh_mac_pub_key: String,
        sea_spec: String,
        mac_spec: String,
        sec_data_signature: String,
    },
    #[serde(rename_all = "camelCase")]
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    New { user_id: i64 },
    #[serde(rename_all = "camelCase")]
    All { user_id: i64 },
    #[serde(rename_all = "camelCase")]
    Send {
        sender_id: i64,
        receiver_id: i64,
        text: String,
        #[serde(default)]
        attachment_data: String,
        #[serde(default)]
        attachments: String,
        #[serde(rename = "cipherIV", default, skip_serializing_if = "Option::is_none")]
        cipher_iv: Option<String>,
        sender_signature: String,
    },
    #[serde(rename_all = "camelCase")]
    Receive { message_id: i64 },
    #[serde(rename_all = "camelCase")]
    Receipt {
        message_id: i64,
        receiver_signature: String,
        date: String,
    },
    #[serde(rename_all = "camelCase")]
    Status { message_id: i64 },
    Params,
}

/// A request type with a closed set of `type` values.
pub trait WireRequest: DeserializeOwned + Serialize {
    const ROUTES: &'static [&'static str];

    fn route(&self) -> &'static str;

    /// Whether the request must carry a freshness nonce.
    fn needs_nonce(&self) -> bool {
        false
    }
}

impl WireRequest for PkiRequest {
    const ROUTES: &'static [&'static str] = &["sign", "check"];

    fn route(&self) -> &'static str {
        match self {
            PkiRequest::Sign { .. } => "sign",
            PkiRequest::Check { .. } => "check",
        }
    }
}

impl WireRequest for MailboxRequest {
    const ROUTES: &'static [&'static str] = &[
        "create", "list", "new", "all", "send", "receive", "receipt", "status", "params",
    ];

    fn route(&self) -> &'static str {
        match self {
            MailboxRequest::Create { .. } => "create",
            MailboxRequest::List { .. } => "list",
            MailboxRequest::New { .. } => "new",
            MailboxRequest::All { .. } => "all",
            MailboxRequest::Send { .. } => "send",
            MailboxRequest::Receive { .. } => "receive",
            MailboxRequest::Receipt { .. } => "receipt",
            MailboxRequest::Status { .. } => "status",
            MailboxRequest::Params => "params",
        }
    }

    fn needs_nonce(&self) -> bool {
        !matches!(self, MailboxRequest::Receipt { .. })
    }
}

/// A parsed request together with its optional nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    pub nonce: Option<String>,
    pub request: T,
}

/// Validate and type a raw request value.
///
/// # Errors
/// * `MissingValue` - no `type`, a required field, or a required nonce is absent
/// * `InvalidRoute` - `type` names no known route
/// * `InvalidFormat` - anything else that does not match the schema
pub fn parse_request<T: WireRequest>(value: Value) -> Result<Envelope<T>, ServiceError> {
    let object = match &value {
        Value::Object(object) => object,
        _ => {
            return Err(ServiceError::InvalidFormat(
                "Request must be a JSON object.".to_string(),
            ))
        }
    };

    let route = match object.get("type") {
        None => return Err(ServiceError::MissingValue("type".to_string())),
        Some(Value::String(route)) => route,
        Some(_) => {
            return Err(ServiceError::InvalidFormat(
                "Field 'type' must be a string.".to_string(),
            ))
        }
    };
    if !T::ROUTES.contains(&route.as_str()) {
        return Err(ServiceError::InvalidRoute);
    }

    let nonce = match object.get("nonce") {
        None | Some(Value::Null) => None,
        Some(Value::String(nonce)) => Some(nonce.clone()),
        Some(_) => {
            return Err(ServiceError::InvalidFormat(
                "Field 'nonce' must be a string.".to_string(),
            ))
        }
    };

    let request: T = serde_json::from_value(value).map_err(|e| {
        let message = e.to_string();
        match message.strip_prefix("missing field ") {
            Some(field) => ServiceError::MissingValue(field.trim_matches('`').to_string()),
            None => ServiceError::InvalidFormat(format!("Malformed request: {}", message)),
        }
    })?;

    if request.needs_nonce() && nonce.is_none() {
        return Err(ServiceError::MissingValue("nonce".to_string()));
    }

    Ok(Envelope { nonce, request })
}

/// Serialize a request with an optional nonce.
///
/// # Example
/// ```
/// use pki_mailbox::protocol::{serialize_request, MailboxRequest};
///
/// let bytes = serialize_request(&MailboxRequest::Params, Some("n1"))?;
/// assert_eq!(bytes, br#"{"nonce":"n1","type":"params"}"#);
/// # Ok::<(), serde_json::Error>(())
/// ```
pub fn serialize_request<T: Serialize>(
    request: &T,
    nonce: Option<&str>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(request)?;
    if let (Some(nonce), Value::Object(object)) = (nonce, &mut value) {
        object.insert("nonce".to_string(), Value::String(nonce.to_string()));
    }
    serde_json::to_vec(&value)
}

/// The response envelope.
///
/// Successful responses carry the request nonce (if any) and route-specific
/// payload fields; failures carry only `status` and `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Response {
    pub fn success(nonce: Option<String>, payload: Payload) -> Self {
        Self {
            status: Status::ok(),
            nonce,
            error: None,
            payload,
        }
    }

    pub fn failure(err: &ServiceError) -> Self {
        Self {
            status: err.status(),
            nonce: None,
            error: Some(err.public_message()),
            payload: Payload::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// Typed payload field.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ServiceError> {
        let value = self
            .payload
            .get(name)
            .ok_or_else(|| ServiceError::MissingValue(name.to_string()))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ServiceError::InvalidFormat(format!("Field '{}': {}", name, e)))
    }
}

/// Why a request could not be read off the socket.
#[derive(Debug)]
pub enum ReadError {
    /// The peer went away or timed out; nothing is sent back.
    Closed(io::Error),
    /// The bytes received are not an acceptable request; answered with 400.
    Rejected(ServiceError),
}

/// Read one JSON value, refusing to consume more than `limit` bytes.
pub fn read_value<R: Read>(reader: R, limit: u64) -> Result<Value, ReadError> {
    let mut limited = reader.take(limit);
    let result = {
        let mut de = serde_json::Deserializer::from_reader(BufReader::new(&mut limited));
        Value::deserialize(&mut de)
    };
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_eof() && limited.limit() == 0 => Err(ReadError::Rejected(
            ServiceError::InvalidFormat(format!("Request exceeds {} bytes.", limit)),
        )),
        Err(e) if e.is_io() || e.is_eof() => Err(ReadError::Closed(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            e,
        ))),
        Err(e) => Err(ReadError::Rejected(ServiceError::InvalidFormat(format!(
            "Malformed JSON: {}",
            e
        )))),
    }
}

/// Read and decode one response envelope.
pub fn read_response<R: Read>(reader: R, limit: u64) -> Result<Response, ReadError> {
    let value = read_value(reader, limit)?;
    serde_json::from_value(value).map_err(|e| {
        ReadError::Rejected(ServiceError::InvalidFormat(format!(
            "Malformed response: {}",
            e
        )))
    })
}

/// Serialize a response to its wire bytes.
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(response)
}

/// Write one response and flush.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    let bytes = serialize_response(response)?;
    writer.write_all(&bytes)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_create_with_nonce() {
        let value = json!({
            "type": "create",
            "uuid": "u-1",
            "dhSeaPubKey": "AAAB",
            "dhMacPubKey": "AAAC",
            "seaSpec": "AES/CBC/PKCS5",
            "macSpec": "HmacSHA256",
            "secDataSignature": "c2ln",
            "nonce": "n1"
        });
        let envelope: Envelope<MailboxRequest> = parse_request(value).unwrap();
        assert_eq!(envelope.nonce.as_deref(), Some("n1"));
        match envelope.request {
            MailboxRequest::Create { uuid, sea_spec, .. } => {
                assert_eq!(uuid, "u-1");
                assert_eq!(sea_spec, "AES/CBC/PKCS5");
            }
            other => panic!("Wrong request type: {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors_are_classified() {
        let unknown = parse_request::<MailboxRequest>(json!({"type": "delete", "nonce": "n"}));
        assert!(matches!(unknown, Err(ServiceError::InvalidRoute)));

        let untyped = parse_request::<MailboxRequest>(json!({"nonce": "n"}));
        assert!(matches!(untyped, Err(ServiceError::MissingValue(f)) if f == "type"));

        let no_field = parse_request::<MailboxRequest>(json!({"type": "new", "nonce": "n"}));
        assert!(matches!(no_field, Err(ServiceError::MissingValue(f)) if f == "userId"));

        let bad_type =
            parse_request::<MailboxRequest>(json!({"type": "new", "userId": "x", "nonce": "n"}));
        assert!(matches!(bad_type, Err(ServiceError::InvalidFormat(_))));

        let not_object = parse_request::<PkiRequest>(json!([1, 2]));
        assert!(matches!(not_object, Err(ServiceError::InvalidFormat(_))));
    }

    #[test]
    fn test_nonce_requirements() {
        let missing = parse_request::<MailboxRequest>(json!({"type": "params"}));
        assert!(matches!(missing, Err(ServiceError::MissingValue(f)) if f == "nonce"));

        let receipt = parse_request::<MailboxRequest>(json!({
            "type": "receipt",
            "messageId": 1,
            "receiverSignature": "c2ln",
            "date": "01/01/2024 00:00:00"
        }))
        .unwrap();
        assert!(receipt.nonce.is_none());

        let check = parse_request::<PkiRequest>(json!({"type": "check", "serial": 42})).unwrap();
        assert_eq!(check.request, PkiRequest::Check { serial: 42 });
    }

    #[test]
    fn test_send_optional_fields() {
        let envelope: Envelope<MailboxRequest> = parse_request(json!({
            "type": "send",
            "senderId": 1,
            "receiverId": 2,
            "text": "Y3Q=",
            "senderSignature": "c2ln",
            "nonce": "n"
        }))
        .unwrap();
        match envelope.request {
            MailboxRequest::Send {
                attachment_data,
                attachments,
                cipher_iv,
                ..
            } => {
                assert!(attachment_data.is_empty());
                assert!(attachments.is_empty());
                assert!(cipher_iv.is_none());
            }
            other => panic!("Wrong request type: {:?}", other),
        }

        let bytes = serialize_request(
            &MailboxRequest::Send {
                sender_id: 1,
                receiver_id: 2,
                text: "t".into(),
                attachment_data: String::new(),
                attachments: String::new(),
                cipher_iv: Some("aXY=".into()),
                sender_signature: "s".into(),
            },
            Some("n"),
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["cipherIV"], "aXY=");
        assert_eq!(value["senderId"], 1);
    }

    #[test]
    fn test_response_envelopes() {
        let mut payload = Payload::new();
        payload.insert("userId".into(), json!(1));
        let ok = Response::success(Some("n1".into()), payload);
        let value: Value = serde_json::from_slice(&serialize_response(&ok).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"status": {"code": 200, "message": "OK"}, "nonce": "n1", "userId": 1})
        );

        let err = Response::failure(&ServiceError::DuplicateEntry(
            "User ID already registered.".into(),
        ));
        let value: Value = serde_json::from_slice(&serialize_response(&err).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "status": {"code": 400, "message": "Bad Request"},
                "error": "User ID already registered."
            })
        );

        let parsed: Response = serde_json::from_value(json!({
            "status": {"code": 200, "message": "OK"}, "nonce": "n", "messageId": 7
        }))
        .unwrap();
        assert_eq!(parsed.get::<i64>("messageId").unwrap(), 7);
        assert!(parsed.get::<i64>("userId").is_err());
    }

    #[test]
    fn test_read_value_limits() {
        let body = br#"{"type":"params","nonce":"abc"}"#;
        let value = read_value(&body[..], 1024).unwrap();
        assert_eq!(value["type"], "params");

        match read_value(&body[..], 10) {
            Err(ReadError::Rejected(ServiceError::InvalidFormat(_))) => {}
            other => panic!("Expected rejection, got {:?}", other),
        }

        match read_value(&b"{\"type\":"[..], 1024) {
            Err(ReadError::Closed(_)) => {}
            other => panic!("Expected closed, got {:?}", other),
        }

        match read_value(&b"{not json}"[..], 1024) {
            Err(ReadError::Rejected(_)) => {}
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_value_followed_by_trailing_bytes() {
        let body = b"{\"type\":\"check\",\"serial\":1}garbage";
        let value = read_value(&body[..], 1024).unwrap();
        assert_eq!(value["serial"], 1);
    }
}
