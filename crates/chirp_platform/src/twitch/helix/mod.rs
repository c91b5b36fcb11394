#![forbid(unsafe_code)]

//! Subscription calls against the Helix REST API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::SecretString;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

/// Body of `POST /helix/eventsub/subscriptions` for websocket delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubscriptionRequest {
	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub condition: serde_json::Value,
	pub transport: WebsocketTransport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebsocketTransport {
	pub method: String,
	pub session_id: String,
}

impl CreateSubscriptionRequest {
	pub fn websocket(kind: &str, version: &str, condition: serde_json::Value, session_id: &str) -> Self {
		Self {
			kind: kind.to_string(),
			version: version.to_string(),
			condition,
			transport: WebsocketTransport {
				method: "websocket".to_string(),
				session_id: session_id.to_string(),
			},
		}
	}
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionResponse {
	data: Vec<CreatedSubscription>,
}

#[derive(Debug, Deserialize)]
struct CreatedSubscription {
	id: String,
}

/// Performs subscription registration on behalf of an event session.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
	/// Returns the server-assigned subscription id.
	async fn create_subscription(&self, token: &SecretString, req: &CreateSubscriptionRequest) -> anyhow::Result<String>;

	async fn delete_subscription(&self, token: &SecretString, id: &str) -> anyhow::Result<()>;
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs).min(MAX_RETRY_WAIT));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now).min(MAX_RETRY_WAIT));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tracing::warn!(label, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("chirp/", env!("CARGO_PKG_VERSION"), " (eventsub-ws)"))
			.timeout(Duration::from_secs(20))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, token: &SecretString) -> reqwest::RequestBuilder {
		let bearer = token.expose().trim();
		let bearer = bearer.strip_prefix("oauth:").unwrap_or(bearer);
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {bearer}"))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}
}

#[async_trait]
impl SubscriptionApi for HelixClient {
	async fn create_subscription(&self, token: &SecretString, req: &CreateSubscriptionRequest) -> anyhow::Result<String> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let kind = req.kind.as_str();

		let resp = send_with_retry(self.authed(self.http.post(url), token).json(req), "POST /helix/eventsub/subscriptions")
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
		}

		let parsed: CreateSubscriptionResponse =
			serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={kind})"))?;
		parsed
			.data
			.into_iter()
			.next()
			.map(|s| s.id)
			.with_context(|| format!("helix create subscription returned no data (type={kind})"))
	}

	async fn delete_subscription(&self, token: &SecretString, id: &str) -> anyhow::Result<()> {
		let mut url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		url.query_pairs_mut().append_pair("id", id);

		let resp = send_with_retry(self.authed(self.http.delete(url), token), "DELETE /helix/eventsub/subscriptions")
			.await
			.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		// already gone counts as deleted
		if status.is_success() || status == StatusCode::NOT_FOUND {
			return Ok(());
		}
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix delete subscription failed (id={id}): status={status} body={body}")
	}
}
