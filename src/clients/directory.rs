use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        http::{HttpFailure, build_client, endpoint},
    },
    config::Config,
    models::{
        notification::Channel,
        recipient::{ContactPage, UserContacts},
        retry::RetryConfig,
    },
    ports::ContactDirectory,
    utils::retry_when,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactLookup<'a> {
    user_ids: &'a [String],
    channels: &'a BTreeSet<Channel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactLookupResponse {
    #[serde(default)]
    contacts: HashMap<String, UserContacts>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentMembers {
    #[serde(default)]
    user_ids: Vec<String>,
}

/// User directory and segmentation service over HTTP.
///
/// - `POST {base}/api/v1/users/contacts` with `{userIds, channels}`
/// - `GET {base}/api/v1/segments/{name}/members` (404 means no such segment)
/// - `GET {base}/api/v1/users?channel=..&pageSize=..&cursor=..`
pub struct HttpDirectory {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpDirectory {
    pub fn new(config: &Config, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, Error> {
        info!(base_url = %config.directory_service_url, "Directory client initialized");

        Ok(Self {
            http_client: build_client(Duration::from_secs(10))?,
            base_url: config.directory_service_url.clone(),
            retry_config: config.retry_config(),
            circuit_breaker,
        })
    }

    /// GET or POST once. `None` when the service answers 404.
    async fn exchange<B, T>(&self, url: &Url, body: Option<&B>) -> Result<Option<T>, HttpFailure>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let request = match body {
            Some(body) => self.http_client.post(url.clone()).json(body),
            None => self.http_client.get(url.clone()),
        };

        let response = request.send().await.map_err(HttpFailure::from_reqwest)?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(HttpFailure::from_reqwest),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(HttpFailure::from_response(response).await),
        }
    }

    async fn call<B, T>(&self, what: &str, url: Url, body: Option<&B>) -> Result<Option<T>, Error>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        self.circuit_breaker
            .call(|| async {
                retry_when(
                    &self.retry_config,
                    || self.exchange::<B, T>(&url, body),
                    HttpFailure::is_transient,
                )
                .await
                .map_err(|e| anyhow!("Directory {} failed: {}", what, e))
            })
            .await
    }
}

#[async_trait]
impl ContactDirectory for HttpDirectory {
    async fn lookup_contacts(
        &self,
        user_ids: &[String],
        channels: &BTreeSet<Channel>,
    ) -> Result<HashMap<String, UserContacts>> {
        let url = endpoint(&self.base_url, &["api", "v1", "users", "contacts"])?;
        let body = ContactLookup { user_ids, channels };

        debug!(users = user_ids.len(), "Looking up user contacts");

        let found: Option<ContactLookupResponse> =
            self.call("contact lookup", url, Some(&body)).await?;

        Ok(found.map(|response| response.contacts).unwrap_or_default())
    }

    async fn resolve_segment(&self, name: &str) -> Result<Option<Vec<String>>> {
        let url = endpoint(&self.base_url, &["api", "v1", "segments", name, "members"])?;

        debug!(segment = name, "Resolving segment");

        let members: Option<SegmentMembers> = self.call::<(), _>("segment lookup", url, None).await?;
        Ok(members.map(|members| members.user_ids))
    }

    async fn list_all_users(
        &self,
        channel: Channel,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ContactPage> {
        let mut url = endpoint(&self.base_url, &["api", "v1", "users"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("channel", channel.as_str())
                .append_pair("pageSize", &page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let page: Option<ContactPage> = self.call::<(), _>("user listing", url, None).await?;
        Ok(page.unwrap_or_default())
    }
}
