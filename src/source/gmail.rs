//! Provider-API source — Gmail-style REST transport.
//!
//! Lists unread inbox messages, fetches each payload in full, and decodes
//! the first `text/plain` part (falling back to a single-part body). The
//! bearer token comes from the credential store; refreshing it does not
//! happen here.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MailboxConfig;
use crate::error::{ParseError, TransportError};
use crate::message::InboundMessage;
use crate::source::{Fetched, MessageSource};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail-style REST source.
pub struct GmailSource {
    config: MailboxConfig,
    client: reqwest::Client,
}

impl GmailSource {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn token(&self) -> Result<String, TransportError> {
        self.config
            .access_token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .ok_or_else(|| TransportError::Auth("missing access token".into()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token()?)
            .query(query)
            .send()
            .await
            .map_err(connect_err)?;
        let response = check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("invalid API response: {e}")))
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(connect_err)?;
        check_status(response)
    }

    async fn list_labels(&self) -> Result<Vec<Label>, TransportError> {
        let payload: LabelListResponse =
            self.get_json(&format!("{API_BASE}/labels"), &[]).await?;
        Ok(payload.labels.unwrap_or_default())
    }

    async fn create_label(&self, name: &str) -> Result<Option<String>, TransportError> {
        let response = self
            .post_json(
                &format!("{API_BASE}/labels"),
                serde_json::json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }),
            )
            .await?;
        let label: Label = response
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("invalid label response: {e}")))?;
        Ok(label.id)
    }
}

fn connect_err(e: reqwest::Error) -> TransportError {
    if e.is_connect() || e.is_timeout() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        Err(TransportError::Auth(format!("API returned {status}")))
    } else {
        Err(TransportError::Transient(format!("API returned {status}")))
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn check(&self) -> Result<(), TransportError> {
        let _: serde_json::Value = self.get_json(&format!("{API_BASE}/profile"), &[]).await?;
        Ok(())
    }

    async fn fetch_unseen(&self) -> Result<Vec<Fetched>, TransportError> {
        let list: ListMessagesResponse = self
            .get_json(
                &format!("{API_BASE}/messages"),
                &[("q", "in:inbox is:unread")],
            )
            .await?;

        let refs = list.messages.unwrap_or_default();
        let mut results = Vec::with_capacity(refs.len());

        for item in refs {
            let detail: MessageResponse = self
                .get_json(
                    &format!("{API_BASE}/messages/{}", item.id),
                    &[("format", "full")],
                )
                .await?;

            match build_message(detail) {
                Ok(message) => results.push(Fetched::Parsed(message)),
                Err(error) => results.push(Fetched::Unparsed {
                    source_ref: item.id,
                    error,
                }),
            }
        }

        Ok(results)
    }

    async fn archive(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.post_json(
            &format!("{API_BASE}/messages/{}/modify", message.source_ref),
            serde_json::json!({ "removeLabelIds": ["INBOX"] }),
        )
        .await?;
        debug!(message_id = %message.message_id, "Message archived");
        Ok(())
    }

    async fn add_label(
        &self,
        message: &InboundMessage,
        name: &str,
    ) -> Result<(), TransportError> {
        let label_id = match find_label(&self.list_labels().await?, name) {
            Some(id) => id,
            None => match self.create_label(name).await {
                Ok(Some(id)) => id,
                // Lost a create race or got an empty body — re-resolve
                // before giving up.
                Ok(None) | Err(_) => find_label(&self.list_labels().await?, name)
                    .ok_or_else(|| {
                        TransportError::Transient(format!("label '{name}' could not be created"))
                    })?,
            },
        };

        self.post_json(
            &format!("{API_BASE}/messages/{}/modify", message.source_ref),
            serde_json::json!({ "addLabelIds": [label_id] }),
        )
        .await?;
        Ok(())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagePayload {
    headers: Option<Vec<Header>>,
    parts: Option<Vec<MessagePart>>,
    body: Option<PartBody>,
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    body: Option<PartBody>,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    labels: Option<Vec<Label>>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: Option<String>,
    name: Option<String>,
}

// ── Payload decoding ────────────────────────────────────────────────

fn build_message(detail: MessageResponse) -> Result<InboundMessage, ParseError> {
    let payload = detail
        .payload
        .ok_or_else(|| ParseError::Message("message payload missing".into()))?;

    let from = header_value(&payload, "From").unwrap_or_default();
    let to = header_value(&payload, "To").unwrap_or_default();
    let subject = header_value(&payload, "Subject");
    let body = extract_body(&payload)?;

    let received_at = detail
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(InboundMessage {
        // The provider id is stable, so it doubles as the dedup key.
        message_id: detail.id.clone(),
        source_ref: detail.id,
        from,
        to,
        subject,
        body,
        received_at,
    })
}

fn header_value(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Prefer the first `text/plain` part; fall back to the single-part body.
fn extract_body(payload: &MessagePayload) -> Result<String, ParseError> {
    if let Some(parts) = &payload.parts
        && let Some(part) = parts
            .iter()
            .find(|p| p.mime_type.as_deref() == Some("text/plain"))
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref())
    {
        return decode_body(data);
    }
    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_ref()) {
        return decode_body(data);
    }
    Ok(String::new())
}

fn decode_body(data: &str) -> Result<String, ParseError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.as_bytes())
        .or_else(|_| URL_SAFE.decode(data.as_bytes()))
        .map_err(|e| ParseError::Decode(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn find_label(labels: &[Label], name: &str) -> Option<String> {
    labels
        .iter()
        .find(|l| l.name.as_deref() == Some(name))
        .and_then(|l| {
            if l.id.is_none() {
                warn!(label = %name, "Label listed without an id");
            }
            l.id.clone()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    fn header(name: &str, value: &str) -> Header {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn prefers_text_plain_part() {
        let payload = MessagePayload {
            headers: Some(vec![
                header("From", "Alice <alice@example.com>"),
                header("To", "me@example.com"),
                header("Subject", "Hello"),
            ]),
            parts: Some(vec![
                MessagePart {
                    mime_type: Some("text/html".into()),
                    body: Some(PartBody {
                        data: Some(encoded("<p>Hello</p>")),
                    }),
                },
                MessagePart {
                    mime_type: Some("text/plain".into()),
                    body: Some(PartBody {
                        data: Some(encoded("Hello in plain text")),
                    }),
                },
            ]),
            body: None,
        };

        let detail = MessageResponse {
            id: "msg-1".into(),
            internal_date: Some("1767225600000".into()),
            payload: Some(payload),
        };

        let message = build_message(detail).unwrap();
        assert_eq!(message.message_id, "msg-1");
        assert_eq!(message.from, "Alice <alice@example.com>");
        assert_eq!(message.subject.as_deref(), Some("Hello"));
        assert_eq!(message.body, "Hello in plain text");
    }

    #[test]
    fn falls_back_to_single_part_body() {
        let payload = MessagePayload {
            headers: Some(vec![header("From", "a@b.c")]),
            parts: None,
            body: Some(PartBody {
                data: Some(encoded("single part body")),
            }),
        };
        let detail = MessageResponse {
            id: "msg-2".into(),
            internal_date: None,
            payload: Some(payload),
        };
        assert_eq!(build_message(detail).unwrap().body, "single part body");
    }

    #[test]
    fn padded_base64_is_accepted() {
        let padded = URL_SAFE.encode("padded!".as_bytes());
        assert_eq!(decode_body(&padded).unwrap(), "padded!");
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        assert!(matches!(decode_body("!!not base64!!"), Err(ParseError::Decode(_))));
    }

    #[test]
    fn missing_payload_is_a_parse_error() {
        let detail = MessageResponse {
            id: "msg-3".into(),
            internal_date: None,
            payload: None,
        };
        assert!(build_message(detail).is_err());
    }

    #[test]
    fn find_label_reuses_existing_id() {
        let labels = vec![
            Label {
                id: Some("Label_7".into()),
                name: Some("Processed".into()),
            },
            Label {
                id: Some("Label_8".into()),
                name: Some("Other".into()),
            },
        ];
        assert_eq!(find_label(&labels, "Processed").as_deref(), Some("Label_7"));
        assert_eq!(find_label(&labels, "Missing"), None);
    }
}
