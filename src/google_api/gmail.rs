//! Gmail API v1 — windowed message fetch for intelligence sync.
//!
//! Lists message ids matching `after:<date>`, pages until the hard cap,
//! then fetches full content per id and normalizes headers and body into
//! [`MessageRecord`]s. Individual message fetch failures are skipped.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use super::{send_with_retry, Credential, RetryPolicy};

/// Gmail caps maxResults per list page at 500; we stay well under it.
const LIST_PAGE_LIMIT: u32 = 100;

/// Keywords that mark a message as potentially urgent.
const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediate",
    "deadline",
    "important",
    "response needed",
    "please respond",
    "contract",
    "funding",
];

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    snippet: String,
    /// Epoch milliseconds as a string, per the Gmail API.
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

// ============================================================================
// Public types
// ============================================================================

/// A name + address pair parsed from a From/To header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Mailbox {
    pub name: String,
    pub address: String,
}

/// A normalized email, immutable once fetched.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender: Mailbox,
    pub recipients: Vec<Mailbox>,
    pub subject: String,
    /// Body excerpt bounded by the configured character budget.
    pub excerpt: String,
    pub timestamp: DateTime<Utc>,
    /// Unread and matching an urgency keyword.
    pub urgent: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The mail API rejected the credential; re-authentication is required.
    #[error("mail API authentication failed")]
    Auth,
    /// Rate limit or server-side failure; the whole fetch may be retried.
    #[error("transient mail API failure: {0}")]
    Transient(String),
    /// Malformed response or a non-retryable rejection.
    #[error("permanent mail API failure: {0}")]
    Permanent(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            FetchError::Transient(err.to_string())
        } else {
            FetchError::Permanent(err.to_string())
        }
    }
}

/// Paginated retrieval of recent messages for a time window.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn fetch_recent(
        &self,
        credential: &Credential,
        window_days: u32,
        max_results: u32,
    ) -> Result<Vec<MessageRecord>, FetchError>;
}

// ============================================================================
// Gmail client
// ============================================================================

pub struct GmailMailer {
    client: reqwest::Client,
    base_url: String,
    excerpt_chars: usize,
}

impl GmailMailer {
    pub fn new(timeout: std::time::Duration, excerpt_chars: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: "https://gmail.googleapis.com/gmail/v1".to_string(),
            excerpt_chars,
        }
    }

    /// Override the API base URL (local test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// List message ids matching the window query, paging until the cap.
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, FetchError> {
        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = max_results.saturating_sub(ids.len() as u32);
            if remaining == 0 {
                break;
            }

            let page_size = page_budget(remaining);
            let mut params: Vec<(&str, String)> = vec![
                ("q", query.to_string()),
                ("maxResults", page_size.to_string()),
            ];
            if let Some(ref token) = page_token {
                params.push(("pageToken", token.clone()));
            }

            let resp = send_with_retry(
                self.client
                    .get(format!("{}/users/me/messages", self.base_url))
                    .bearer_auth(access_token)
                    .query(&params),
                &RetryPolicy::default(),
            )
            .await?;

            let status = resp.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(FetchError::Auth);
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }

            let list: MessageListResponse = resp
                .json()
                .await
                .map_err(|e| FetchError::Permanent(format!("malformed list response: {}", e)))?;

            absorb_page(&mut ids, list.messages, max_results);

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    /// Fetch full content for one message.
    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<MessageDetail, FetchError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, message_id);
        let resp = send_with_retry(
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("format", "full")]),
            &RetryPolicy::default(),
        )
        .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FetchError::Auth);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        resp.json()
            .await
            .map_err(|e| FetchError::Permanent(format!("malformed message response: {}", e)))
    }
}

#[async_trait]
impl MailProvider for GmailMailer {
    async fn fetch_recent(
        &self,
        credential: &Credential,
        window_days: u32,
        max_results: u32,
    ) -> Result<Vec<MessageRecord>, FetchError> {
        let since = Utc::now().date_naive() - chrono::Duration::days(window_days as i64);
        let query = after_query(since);
        log::info!(
            "Fetching messages with query '{}', cap {}",
            query,
            max_results
        );

        let ids = self
            .list_message_ids(&credential.token, &query, max_results)
            .await?;
        log::info!("Found {} message ids in window", ids.len());

        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.fetch_message(&credential.token, id).await {
                Ok(detail) => {
                    if let Some(record) = normalize_message(detail, self.excerpt_chars) {
                        records.push(record);
                    }
                }
                Err(FetchError::Auth) => return Err(FetchError::Auth),
                Err(e) => {
                    log::debug!("Skipping message {}: {}", id, e);
                    continue;
                }
            }
        }

        log::info!("Normalized {} messages", records.len());
        Ok(records)
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> FetchError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FetchError::Transient(format!("HTTP {}: {}", status, body))
    } else {
        FetchError::Permanent(format!("HTTP {}: {}", status, body))
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Gmail query clause for "messages after this date".
fn after_query(since: NaiveDate) -> String {
    format!("after:{}", since.format("%Y/%m/%d"))
}

/// Clamp a list page request to the per-page limit.
fn page_budget(remaining: u32) -> u32 {
    remaining.min(LIST_PAGE_LIMIT)
}

/// Append a page of listed ids, enforcing `max_results` as a hard cap no
/// matter how many pages the API still has.
fn absorb_page(ids: &mut Vec<String>, page: Vec<MessageStub>, max_results: u32) {
    for stub in page {
        if ids.len() as u32 >= max_results {
            break;
        }
        ids.push(stub.id);
    }
}

/// Turn a raw API message into a [`MessageRecord`].
///
/// Returns None when the message has no usable sender address, which keeps
/// calendar invites and malformed bounces out of the extraction input.
fn normalize_message(detail: MessageDetail, excerpt_chars: usize) -> Option<MessageRecord> {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let get_header = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let sender = parse_mailboxes(&get_header("From")).into_iter().next()?;
    let recipients = parse_mailboxes(&get_header("To"));
    let subject = get_header("Subject");

    let body = detail
        .payload
        .as_ref()
        .and_then(|p| extract_body_text(p, "text/plain").or_else(|| extract_body_text(p, "text/html")))
        .unwrap_or_else(|| detail.snippet.clone());
    let excerpt = truncate_excerpt(&body, excerpt_chars);

    let timestamp = parse_internal_date(detail.internal_date.as_deref()).unwrap_or_else(Utc::now);
    let unread = detail.label_ids.iter().any(|l| l == "UNREAD");
    let urgent = unread && is_potentially_urgent(&subject, &excerpt);

    Some(MessageRecord {
        id: detail.id,
        sender,
        recipients,
        subject,
        excerpt,
        timestamp,
        urgent,
    })
}

/// Parse epoch milliseconds (Gmail's `internalDate`) into a UTC timestamp.
fn parse_internal_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let millis: i64 = raw?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse addresses from a header value like
/// `"Alice" <alice@x.com>, Bob <bob@x.com>, carol@x.com`.
fn parse_mailboxes(header: &str) -> Vec<Mailbox> {
    let mut results = Vec::new();
    for part in header.split(',') {
        let trimmed = part.trim();
        if let (Some(lt), Some(gt)) = (trimmed.find('<'), trimmed.find('>')) {
            if lt < gt {
                let address = trimmed[lt + 1..gt].trim().to_string();
                let name = trimmed[..lt].trim().trim_matches('"').trim().to_string();
                if address.contains('@') {
                    results.push(Mailbox { name, address });
                }
            }
        } else if trimmed.contains('@') {
            results.push(Mailbox {
                name: String::new(),
                address: trimmed.to_string(),
            });
        }
    }
    results
}

/// Bound a body to the excerpt budget without splitting a UTF-8 boundary.
fn truncate_excerpt(body: &str, budget: usize) -> String {
    if body.chars().count() <= budget {
        return body.to_string();
    }
    let cut: String = body.chars().take(budget).collect();
    format!("{}… [truncated]", cut)
}

/// Keyword urgency heuristic over subject and body.
fn is_potentially_urgent(subject: &str, body: &str) -> bool {
    let subject = subject.to_lowercase();
    let body = body.to_lowercase();
    URGENT_KEYWORDS
        .iter()
        .any(|kw| subject.contains(kw) || body.contains(kw))
}

/// Recursively walk MIME parts for body data matching the target type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(ref body) = payload.body {
            if let Some(ref data) = body.data {
                return decode_url_safe_base64(data);
            }
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

/// Decode URL-safe base64 (no padding) as used by the Gmail API.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    use base64::Engine;
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data) {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(_) => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    fn detail_json(from: &str, to: &str, subject: &str, body: &str) -> String {
        format!(
            r#"{{
                "id": "msg1",
                "snippet": "snippet text",
                "internalDate": "1754300000000",
                "labelIds": ["INBOX"],
                "payload": {{
                    "mimeType": "multipart/alternative",
                    "headers": [
                        {{"name": "From", "value": "{}"}},
                        {{"name": "To", "value": "{}"}},
                        {{"name": "Subject", "value": "{}"}}
                    ],
                    "parts": [
                        {{"mimeType": "text/plain", "body": {{"data": "{}"}}, "parts": []}}
                    ]
                }}
            }}"#,
            from,
            to,
            subject,
            encode(body)
        )
    }

    #[test]
    fn test_message_list_deserialization() {
        let json = r#"{
            "messages": [{"id": "msg1"}, {"id": "msg2"}],
            "nextPageToken": "token123"
        }"#;

        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.messages.len(), 2);
        assert_eq!(resp.messages[0].id, "msg1");
        assert_eq!(resp.next_page_token.as_deref(), Some("token123"));
    }

    #[test]
    fn test_message_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert!(resp.messages.is_empty());
        assert!(resp.next_page_token.is_none());
    }

    #[test]
    fn test_normalize_message_full() {
        let json = detail_json(
            "Jane Doe <jane@customer.com>",
            "Me <me@example.com>, Bob <bob@example.com>",
            "Re: Project Update",
            "Hi, here is the latest.",
        );
        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        let record = normalize_message(detail, 1000).unwrap();

        assert_eq!(record.id, "msg1");
        assert_eq!(record.sender.name, "Jane Doe");
        assert_eq!(record.sender.address, "jane@customer.com");
        assert_eq!(record.recipients.len(), 2);
        assert_eq!(record.recipients[0].address, "me@example.com");
        assert_eq!(record.subject, "Re: Project Update");
        assert_eq!(record.excerpt, "Hi, here is the latest.");
        assert!(!record.urgent);
    }

    #[test]
    fn test_normalize_message_without_sender_dropped() {
        let json = r#"{"id": "msg2", "snippet": "", "payload": {"mimeType": "text/plain", "headers": []}}"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        assert!(normalize_message(detail, 1000).is_none());
    }

    #[test]
    fn test_normalize_falls_back_to_snippet() {
        let json = r#"{
            "id": "msg3",
            "snippet": "only a snippet",
            "internalDate": "1754300000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [{"name": "From", "value": "a@b.com"}]
            }
        }"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        let record = normalize_message(detail, 1000).unwrap();
        assert_eq!(record.excerpt, "only a snippet");
    }

    #[test]
    fn test_excerpt_truncated_to_budget() {
        let long_body = "x".repeat(5000);
        let json = detail_json("a@b.com", "c@d.com", "Long", &long_body);
        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        let record = normalize_message(detail, 1000).unwrap();

        assert!(record.excerpt.ends_with("… [truncated]"));
        assert_eq!(record.excerpt.chars().count(), 1000 + "… [truncated]".chars().count());
    }

    #[test]
    fn test_truncate_excerpt_multibyte_safe() {
        let body = "é".repeat(20);
        let excerpt = truncate_excerpt(&body, 10);
        assert!(excerpt.starts_with(&"é".repeat(10)));
        assert!(excerpt.ends_with("[truncated]"));
    }

    #[test]
    fn test_parse_mailboxes_variants() {
        let parsed = parse_mailboxes(
            "\"Alice\" <alice@x.com>, Bob Smith <bob@y.org>, carol@z.net",
        );
        assert_eq!(
            parsed,
            vec![
                Mailbox {
                    name: "Alice".to_string(),
                    address: "alice@x.com".to_string()
                },
                Mailbox {
                    name: "Bob Smith".to_string(),
                    address: "bob@y.org".to_string()
                },
                Mailbox {
                    name: String::new(),
                    address: "carol@z.net".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_mailboxes_garbage() {
        assert!(parse_mailboxes("undisclosed-recipients:;").is_empty());
        assert!(parse_mailboxes("").is_empty());
    }

    #[test]
    fn test_after_query_format() {
        let date = NaiveDate::from_ymd_opt(2026, 7, 6).unwrap();
        assert_eq!(after_query(date), "after:2026/07/06");
    }

    #[test]
    fn test_page_budget_respects_cap() {
        assert_eq!(page_budget(50), 50);
        assert_eq!(page_budget(250), LIST_PAGE_LIMIT);
        assert_eq!(page_budget(1), 1);
    }

    #[test]
    fn test_absorb_page_enforces_hard_cap() {
        let mut ids = Vec::new();
        // Three pages of 30 against a cap of 50
        for page_no in 0..3 {
            let page: Vec<MessageStub> = (0..30)
                .map(|i| MessageStub {
                    id: format!("p{}m{}", page_no, i),
                })
                .collect();
            absorb_page(&mut ids, page, 50);
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(ids[0], "p0m0");
        assert_eq!(ids[49], "p1m19");
    }

    #[test]
    fn test_urgency_requires_unread() {
        let json = detail_json(
            "boss@corp.com",
            "me@corp.com",
            "URGENT: contract deadline",
            "Please respond asap.",
        );
        // labelIds has INBOX only, no UNREAD → not urgent even with keywords
        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        let record = normalize_message(detail, 1000).unwrap();
        assert!(!record.urgent);

        let json_unread = json.replace(r#"["INBOX"]"#, r#"["INBOX", "UNREAD"]"#);
        let detail: MessageDetail = serde_json::from_str(&json_unread).unwrap();
        let record = normalize_message(detail, 1000).unwrap();
        assert!(record.urgent);
    }

    #[test]
    fn test_urgency_keywords() {
        assert!(is_potentially_urgent("Deadline tomorrow", ""));
        assert!(is_potentially_urgent("", "need your response ASAP"));
        assert!(!is_potentially_urgent("Lunch?", "See you at noon."));
    }

    #[test]
    fn test_parse_internal_date() {
        let ts = parse_internal_date(Some("1754300000000")).unwrap();
        assert_eq!(ts.timestamp_millis(), 1754300000000);
        assert!(parse_internal_date(Some("not-a-number")).is_none());
        assert!(parse_internal_date(None).is_none());
    }

    #[test]
    fn test_extract_body_prefers_plain_text() {
        let json = format!(
            r#"{{
                "mimeType": "multipart/alternative",
                "headers": [],
                "parts": [
                    {{"mimeType": "text/html", "body": {{"data": "{}"}}, "parts": []}},
                    {{"mimeType": "text/plain", "body": {{"data": "{}"}}, "parts": []}}
                ]
            }}"#,
            encode("<p>html</p>"),
            encode("plain text")
        );
        let payload: MessagePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(
            extract_body_text(&payload, "text/plain").as_deref(),
            Some("plain text")
        );
    }

    #[test]
    fn test_decode_url_safe_base64_invalid() {
        assert!(decode_url_safe_base64("!!!not base64!!!").is_none());
    }
}
