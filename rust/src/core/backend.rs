// REST collaborator: authoritative unread snapshots and group membership.

use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadEntry {
    pub conversation_id: String,
    pub count: u32,
}

/// Response of `GET /messages/unread`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSnapshot {
    pub as_of: u64,
    #[serde(default)]
    pub conversations: Vec<UnreadEntry>,
}

impl UnreadSnapshot {
    pub fn count_for(&self, conversation_id: &str) -> Option<u32> {
        self.conversations
            .iter()
            .find(|e| e.conversation_id == conversation_id)
            .map(|e| e.count)
    }
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<String>,
}

/// Idempotent, retryable reads against the backend.
pub trait Backend: Send + Sync + 'static {
    fn fetch_unread(&self) -> BoxFuture<'static, anyhow::Result<UnreadSnapshot>>;
    fn fetch_members(&self, conversation_id: &str) -> BoxFuture<'static, anyhow::Result<Vec<String>>>;
}

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl Backend for HttpBackend {
    fn fetch_unread(&self) -> BoxFuture<'static, anyhow::Result<UnreadSnapshot>> {
        let client = self.client.clone();
        let url = endpoint(&self.base_url, &["messages", "unread"]);
        Box::pin(async move { get_json::<UnreadSnapshot>(&client, url?).await })
    }

    fn fetch_members(&self, conversation_id: &str) -> BoxFuture<'static, anyhow::Result<Vec<String>>> {
        let client = self.client.clone();
        let url = endpoint(
            &self.base_url,
            &["conversations", conversation_id, "members"],
        );
        Box::pin(async move {
            let resp = get_json::<MembersResponse>(&client, url?).await?;
            Ok(resp.members)
        })
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: Url,
) -> anyhow::Result<T> {
    let resp = client
        .get(url.clone())
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("GET {url}: http {status}"));
    }
    resp.json::<T>()
        .await
        .with_context(|| format!("decode response from {url}"))
}

/// Appends percent-encoded path segments to `base`.
fn endpoint(base: &str, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid api base url {base:?}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("api base url cannot carry a path: {base:?}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
