use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use shared::{
    domain::{GroupId, MessageId, UserId},
    protocol::{GroupSummary, MessagePayload},
};

pub mod reconcile;
pub mod transport;

pub use reconcile::{ConversationCache, DeliveryState, LocalMessage};
pub use transport::EventChannel;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSnapshot {
    pub user_id: i64,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateGroupRequest<'a> {
    user_id: i64,
    name: &'a str,
    member_ids: Vec<i64>,
}

/// HTTP side of the client: login, history pages, presence snapshots and
/// roster management. Live traffic runs over [`EventChannel`] instead.
#[derive(Clone)]
pub struct SyncClient {
    http: Client,
    base_url: Url,
    server_url: String,
}

impl SyncClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let base_url = Url::parse(&server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            server_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path: {path}"))
    }

    pub async fn login(&self, username: &str) -> Result<UserId> {
        let response = self
            .http
            .post(self.endpoint("/login")?)
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await
            .context("login request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("login refused: {}", response.status()));
        }
        let body: LoginResponse = response.json().await.context("invalid login response")?;
        Ok(UserId(body.user_id))
    }

    /// Open the live event channel, registered as `identity`.
    pub async fn connect_events(&self, identity: UserId) -> Result<EventChannel> {
        EventChannel::connect(&self.server_url, identity).await
    }

    pub async fn presence(&self, user_id: UserId) -> Result<PresenceSnapshot> {
        let url = self.endpoint(&format!("/presence/{}", user_id.0))?;
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await.context("invalid presence response")?)
    }

    pub async fn direct_history(
        &self,
        me: UserId,
        peer: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let mut url = self.endpoint(&format!("/history/direct/{}", peer.0))?;
        Self::history_query(&mut url, me, limit, before);
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await.context("invalid history response")?)
    }

    pub async fn group_history(
        &self,
        me: UserId,
        group_id: GroupId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let mut url = self.endpoint(&format!("/history/group/{}", group_id.0))?;
        Self::history_query(&mut url, me, limit, before);
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await.context("invalid history response")?)
    }

    fn history_query(url: &mut Url, me: UserId, limit: u32, before: Option<MessageId>) {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("user_id", &me.0.to_string());
        pairs.append_pair("limit", &limit.to_string());
        if let Some(before) = before {
            pairs.append_pair("before", &before.0.to_string());
        }
    }

    pub async fn create_group(
        &self,
        me: UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<GroupSummary> {
        let request = CreateGroupRequest {
            user_id: me.0,
            name,
            member_ids: member_ids.iter().map(|id| id.0).collect(),
        };
        let response = self
            .http
            .post(self.endpoint("/groups")?)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await.context("invalid group response")?)
    }

    pub async fn add_contact(&self, me: UserId, contact_id: UserId) -> Result<()> {
        self.http
            .post(self.endpoint("/contacts")?)
            .json(&serde_json::json!({ "user_id": me.0, "contact_id": contact_id.0 }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn block_user(&self, me: UserId, blocked_id: UserId) -> Result<()> {
        self.http
            .post(self.endpoint("/blocks")?)
            .json(&serde_json::json!({ "user_id": me.0, "blocked_id": blocked_id.0 }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn unblock_user(&self, me: UserId, blocked_id: UserId) -> Result<()> {
        let url = self.endpoint(&format!("/blocks/{}?user_id={}", blocked_id.0, me.0))?;
        self.http.delete(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
