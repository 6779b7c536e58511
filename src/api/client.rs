//! HTTP client for the Mixed Reality services
//!
//! Wraps reqwest::Client; every call is bearer-authenticated with the token
//! it is given.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const STS_BASE: &str = "https://sts.mixedreality.azure.com";

/// Body of the STS token exchange.
#[derive(Debug, Deserialize)]
struct StsResponse {
    #[serde(rename = "AccessToken")]
    access_token: String,
}

pub struct MixedRealityClient {
    http: reqwest::Client,
    sts_base: String,
    rendering_base: String,
}

impl MixedRealityClient {
    pub fn new(region: &str) -> Self {
        Self::with_endpoints(
            STS_BASE,
            &format!("https://remoterendering.{}.mixedreality.azure.com", region),
        )
    }

    pub fn with_endpoints(sts_base: &str, rendering_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            sts_base: sts_base.trim_end_matches('/').to_string(),
            rendering_base: rendering_base.trim_end_matches('/').to_string(),
        }
    }

    /// Exchange an Azure AD token for a Mixed Reality STS token.
    pub async fn sts_token(&self, aad_token: &str, account_id: &str) -> Result<String> {
        let url = format!("{}/accounts/{}/token", self.sts_base, account_id);
        tracing::debug!("STS GET {}", url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(aad_token)
            .send()
            .await
            .with_context(|| format!("STS GET {} failed", url))?;

        let body: StsResponse = check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Failed to parse STS response")?;
        if body.access_token.is_empty() {
            bail!("STS returned an empty access token");
        }
        Ok(body.access_token)
    }

    /// List rendering sessions of the account.
    pub async fn list_sessions(&self, sts_token: &str, account_id: &str) -> Result<serde_json::Value> {
        let url = format!("{}/v1/accounts/{}/sessions", self.rendering_base, account_id);
        tracing::debug!("Rendering GET {}", url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(sts_token)
            .send()
            .await
            .with_context(|| format!("Rendering GET {} failed", url))?;

        check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Failed to parse sessions response")
    }
}

async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- sign in again.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
