//! Twitch Helix APIクライアント

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{format_uptime, StreamStatus, StreamStatusProvider};
use crate::error::ActionError;
use crate::moderation::{ChannelName, ModerationApi};

/// Helix APIのベースURL
pub const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    viewer_count: u64,
    title: String,
    game_name: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct BanRequest<'a> {
    data: BanRequestData<'a>,
}

#[derive(Debug, Serialize)]
struct BanRequestData<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
    reason: &'a str,
}

/// Helix APIクライアント
///
/// ログイン名からユーザーIDへの変換結果はキャッシュする。
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    access_token: String,
    moderator_login: String,
    user_ids: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for HelixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelixClient")
            .field("base_url", &self.base_url)
            .field("moderator_login", &self.moderator_login)
            .finish_non_exhaustive()
    }
}

impl HelixClient {
    /// 新しいクライアントを作成
    ///
    /// `moderator_login` はモデレーション操作を行うアカウント（ボット）。
    pub fn new(
        client_id: impl Into<String>,
        access_token: impl Into<String>,
        moderator_login: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ActionError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        let access_token: String = access_token.into();

        Ok(Self {
            http,
            base_url: HELIX_BASE_URL.to_string(),
            client_id: client_id.into(),
            access_token: access_token.trim_start_matches("oauth:").to_string(),
            moderator_login: moderator_login.into().to_lowercase(),
            user_ids: RwLock::new(HashMap::new()),
        })
    }

    /// ベースURLを差し替える
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .header("Client-Id", &self.client_id)
    }

    /// 2xx以外を `ActionError::Rejected` に変換
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ActionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ActionError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    /// ログイン名からユーザーIDを取得
    pub async fn user_id(&self, login: &str) -> Result<String, ActionError> {
        let login = login.to_lowercase();
        if let Some(id) = self.user_ids.read().get(&login) {
            return Ok(id.clone());
        }

        let response = self
            .request(reqwest::Method::GET, "/users")
            .query(&[("login", login.as_str())])
            .send()
            .await?;
        let users: DataEnvelope<HelixUser> = Self::check(response).await?.json().await?;

        let id = users
            .data
            .into_iter()
            .next()
            .map(|user| user.id)
            .ok_or_else(|| ActionError::UnknownUser {
                username: login.clone(),
            })?;

        debug!("🔎 Resolved user id for {}: {}", login, id);
        self.user_ids.write().insert(login, id.clone());
        Ok(id)
    }

    /// BAN（`duration` 指定時はタイムアウト）を発行
    async fn post_ban(
        &self,
        channel: &ChannelName,
        username: &str,
        duration: Option<u32>,
        reason: &str,
    ) -> Result<(), ActionError> {
        let broadcaster_id = self.user_id(channel.as_str()).await?;
        let moderator_id = self.user_id(&self.moderator_login).await?;
        let user_id = self.user_id(username).await?;

        let body = BanRequest {
            data: BanRequestData {
                user_id: &user_id,
                duration,
                reason,
            },
        };

        let response = self
            .request(reqwest::Method::POST, "/moderation/bans")
            .query(&[
                ("broadcaster_id", broadcaster_id.as_str()),
                ("moderator_id", moderator_id.as_str()),
            ])
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_stream_status(&self, channel: &ChannelName) -> Result<StreamStatus, ActionError> {
        let user_id = self.user_id(channel.as_str()).await?;
        let response = self
            .request(reqwest::Method::GET, "/streams")
            .query(&[("user_id", user_id.as_str())])
            .send()
            .await?;
        let streams: DataEnvelope<HelixStream> = Self::check(response).await?.json().await?;

        Ok(match streams.data.into_iter().next() {
            Some(stream) => StreamStatus {
                is_live: true,
                viewer_count: stream.viewer_count,
                uptime: format_uptime(Utc::now() - stream.started_at),
                title: stream.title,
                category: stream.game_name,
                started_at: Some(stream.started_at),
            },
            None => StreamStatus::offline("Stream Offline"),
        })
    }
}

#[async_trait]
impl ModerationApi for HelixClient {
    async fn delete_message(
        &self,
        channel: &ChannelName,
        message_id: &str,
    ) -> Result<(), ActionError> {
        let broadcaster_id = self.user_id(channel.as_str()).await?;
        let moderator_id = self.user_id(&self.moderator_login).await?;

        let response = self
            .request(reqwest::Method::DELETE, "/moderation/chat")
            .query(&[
                ("broadcaster_id", broadcaster_id.as_str()),
                ("moderator_id", moderator_id.as_str()),
                ("message_id", message_id),
            ])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn timeout_user(
        &self,
        channel: &ChannelName,
        username: &str,
        duration_seconds: u32,
        reason: &str,
    ) -> Result<(), ActionError> {
        self.post_ban(channel, username, Some(duration_seconds), reason)
            .await
    }

    async fn ban_user(
        &self,
        channel: &ChannelName,
        username: &str,
        reason: &str,
    ) -> Result<(), ActionError> {
        self.post_ban(channel, username, None, reason).await
    }
}

#[async_trait]
impl StreamStatusProvider for HelixClient {
    async fn stream_status(&self, channel: &ChannelName) -> StreamStatus {
        match self.fetch_stream_status(channel).await {
            Ok(status) => status,
            Err(e) => {
                warn!("❌ Failed to get stream status for #{}: {}", channel, e);
                StreamStatus::offline("Unable to fetch stream info")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// リクエストラインに応じて固定レスポンスを返すHTTPサーバー
    async fn spawn_http(routes: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let request_line = request.lines().next().unwrap_or_default().to_string();

                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _, _)| request_line.starts_with(prefix))
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, "{}"));

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    fn client(base_url: String) -> HelixClient {
        HelixClient::new("client", "oauth:token", "citadel_bot", Duration::from_secs(5))
            .unwrap()
            .with_base_url(base_url)
    }

    #[tokio::test]
    async fn test_live_stream_status() {
        let base = spawn_http(vec![
            ("GET /users?login=streamer", 200, r#"{"data":[{"id":"42","login":"streamer"}]}"#),
            (
                "GET /streams?user_id=42",
                200,
                r#"{"data":[{"viewer_count":1234,"title":"Ranked grind","game_name":"Valorant","started_at":"2020-01-01T00:00:00Z"}]}"#,
            ),
        ])
        .await;

        let status = client(base)
            .stream_status(&ChannelName::new("streamer"))
            .await;
        assert!(status.is_live);
        assert_eq!(status.viewer_count, 1234);
        assert_eq!(status.category, "Valorant");
        assert!(status.uptime.contains('h'));
    }

    #[tokio::test]
    async fn test_offline_stream_status() {
        let base = spawn_http(vec![
            ("GET /users?login=streamer", 200, r#"{"data":[{"id":"42"}]}"#),
            ("GET /streams?user_id=42", 200, r#"{"data":[]}"#),
        ])
        .await;

        let status = client(base)
            .stream_status(&ChannelName::new("streamer"))
            .await;
        assert_eq!(status, StreamStatus::offline("Stream Offline"));
    }

    #[tokio::test]
    async fn test_stream_status_degrades_on_failure() {
        let base = spawn_http(vec![("GET /users", 401, r#"{"message":"Invalid OAuth token"}"#)]).await;

        let status = client(base)
            .stream_status(&ChannelName::new("streamer"))
            .await;
        assert!(!status.is_live);
        assert_eq!(status.title, "Unable to fetch stream info");
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let base = spawn_http(vec![("GET /users", 200, r#"{"data":[]}"#)]).await;

        let err = client(base).user_id("ghost").await.unwrap_err();
        assert!(matches!(err, ActionError::UnknownUser { username } if username == "ghost"));
    }

    #[tokio::test]
    async fn test_delete_rejected_status_is_reported() {
        let base = spawn_http(vec![
            ("GET /users?login=streamer", 200, r#"{"data":[{"id":"42"}]}"#),
            ("GET /users?login=citadel_bot", 200, r#"{"data":[{"id":"7"}]}"#),
            ("DELETE /moderation/chat", 403, r#"{"message":"missing scope"}"#),
        ])
        .await;

        let err = client(base)
            .delete_message(&ChannelName::new("streamer"), "m-1")
            .await
            .unwrap_err();
        match err {
            ActionError::Rejected { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("missing scope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
