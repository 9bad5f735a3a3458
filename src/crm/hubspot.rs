//! HubSpot CRM v3 client
//!
//! `reqwest`-backed implementation of [`CrmApi`] covering object search,
//! batch association reads, batch object reads and the OAuth refresh grant.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{
    AssociationResult, CrmApi, CrmError, CrmObject, ObjectType, SearchPage, SearchRequest,
    TokenGrant,
};

/// Default base URL for the HubSpot API.
pub const DEFAULT_HUBSPOT_API_BASE: &str = "https://api.hubapi.com";

/// Default HTTP timeout for HubSpot calls in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// HubSpot OAuth app credentials and transport settings.
#[derive(Debug, Clone)]
pub struct HubSpotConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub http_timeout: Duration,
}

impl HubSpotConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: DEFAULT_HUBSPOT_API_BASE.to_string(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct BatchInput<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchReadRequest<'a> {
    inputs: Vec<BatchInput<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<&'a [&'a str]>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// HubSpot API client.
#[derive(Clone)]
pub struct HubSpotClient {
    http: reqwest::Client,
    config: HubSpotConfig,
}

impl HubSpotClient {
    pub fn new(config: HubSpotConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("crm-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn post_json<B, R>(&self, access_token: &str, path: &str, body: &B) -> Result<R, CrmError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;

        decode_response(response).await
    }
}

/// Map a HubSpot response onto either the decoded body or a [`CrmError`].
async fn decode_response<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, CrmError> {
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        return Ok(serde_json::from_slice(&bytes)?);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok());
    let message = response.text().await.unwrap_or_default();

    Err(match status.as_u16() {
        401 | 403 => CrmError::Unauthorized {
            status: status.as_u16(),
            message,
        },
        429 => CrmError::RateLimited { retry_after },
        code => CrmError::Api {
            status: code,
            message,
        },
    })
}

#[async_trait]
impl CrmApi for HubSpotClient {
    async fn search(
        &self,
        access_token: &str,
        object: ObjectType,
        request: &SearchRequest,
    ) -> Result<SearchPage, CrmError> {
        debug!(object = %object, after = ?request.after, "searching CRM objects");
        self.post_json(
            access_token,
            &format!("/crm/v3/objects/{}/search", object.as_str()),
            request,
        )
        .await
    }

    async fn batch_read_associations(
        &self,
        access_token: &str,
        from: ObjectType,
        to: ObjectType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>, CrmError> {
        let body = BatchReadRequest {
            inputs: ids.iter().map(|id| BatchInput { id }).collect(),
            properties: None,
        };
        let response: BatchResponse<AssociationResult> = self
            .post_json(
                access_token,
                &format!(
                    "/crm/v3/associations/{}/{}/batch/read",
                    from.as_str(),
                    to.as_str()
                ),
                &body,
            )
            .await?;
        Ok(response.results)
    }

    async fn batch_read(
        &self,
        access_token: &str,
        object: ObjectType,
        ids: &[String],
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError> {
        let body = BatchReadRequest {
            inputs: ids.iter().map(|id| BatchInput { id }).collect(),
            properties: Some(properties),
        };
        let response: BatchResponse<CrmObject> = self
            .post_json(
                access_token,
                &format!("/crm/v3/objects/{}/batch/read", object.as_str()),
                &body,
            )
            .await?;
        Ok(response.results)
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(self.url("/oauth/v1/token"))
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        // HubSpot answers a revoked or unknown refresh token with 400 BAD_REFRESH_TOKEN.
        if response.status().as_u16() == 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(CrmError::Unauthorized {
                status: 400,
                message,
            });
        }

        decode_response(response).await
    }
}
