//! History fetch over HTTP.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::ChannelKey;
use crate::error::{ChatError, ChatResult};

/// One bounded batch of records for a channel, in arbitrary order. Records
/// are left undecoded: shape checks, validation and ordering are the
/// caller's job, one record at a time.
pub trait HistoryFetcher: Send + Sync + 'static {
    fn fetch_history(
        &self,
        channel: &ChannelKey,
    ) -> impl Future<Output = ChatResult<Vec<Value>>> + Send;
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    response: Option<Vec<Value>>,
}

/// POSTs the channel's routing fields to `<base_url><history_path>` and reads
/// the `response` array.
#[derive(Debug, Clone)]
pub struct HttpHistoryFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ChatError::from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, channel: &ChannelKey) -> String {
        format!("{}{}", self.base_url, channel.history_path())
    }
}

impl HistoryFetcher for HttpHistoryFetcher {
    async fn fetch_history(&self, channel: &ChannelKey) -> ChatResult<Vec<Value>> {
        let url = self.url_for(channel);
        debug!(%channel, %url, "fetching history");

        let resp = self
            .client
            .post(&url)
            .json(&channel.routing_fields())
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%channel, %status, "history request rejected");
            return Err(ChatError::HistoryUnavailable(format!(
                "server returned {status}"
            )));
        }

        let body: HistoryResponse = resp.json().await.map_err(ChatError::from_reqwest)?;
        let records = body.response.unwrap_or_default();
        debug!(%channel, count = records.len(), "history fetched");
        Ok(records)
    }
}
