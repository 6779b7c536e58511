//! Token smoke test against Azure Remote Rendering

pub mod client;

use anyhow::Result;

use crate::auth::Token;
use crate::config::Settings;
use client::MixedRealityClient;

/// Account the smoke test runs against.
#[derive(Debug, Clone, Default)]
pub struct SmokeTarget {
    pub account_id: String,
    pub region: String,
}

impl SmokeTarget {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            account_id: settings.account_id.trim().to_string(),
            region: settings.region.trim().to_string(),
        }
    }
}

/// Exchange `token` at the STS and list sessions with the result.
///
/// Returns the lines to log. A missing token or account is not an error:
/// the test is skipped with a line saying why.
pub async fn test_token(token: &Token, target: &SmokeTarget) -> Result<Vec<String>> {
    if token.is_empty() {
        return Ok(vec!["No valid token provided - can't test".to_string()]);
    }
    if target.account_id.is_empty() {
        return Ok(vec![
            "No Azure Remote Rendering account id configured - can't test".to_string(),
        ]);
    }
    if target.region.is_empty() {
        return Ok(vec![
            "No Azure Remote Rendering region configured - can't test".to_string(),
        ]);
    }

    run_test(&MixedRealityClient::new(&target.region), token, target).await
}

async fn run_test(
    client: &MixedRealityClient,
    token: &Token,
    target: &SmokeTarget,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    let sts = client.sts_token(&token.secret, &target.account_id).await?;
    lines.push("Successfully retrieved access token from Mixed Reality STS".to_string());
    lines.push(format!("STS Token: {}", Token::new(sts.clone(), None).preview()));

    let sessions = client.list_sessions(&sts, &target.account_id).await?;
    let count = sessions
        .get("sessions")
        .and_then(|s| s.as_array())
        .map(|s| s.len())
        .unwrap_or(0);
    lines.push(format!(
        "Successfully made a call to the Azure Remote Rendering Service REST API ({} session(s))",
        count
    ));
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target() -> SmokeTarget {
        SmokeTarget {
            account_id: "acc-1".to_string(),
            region: "westus2".to_string(),
        }
    }

    /// Serve one canned reply per connection and return the request lines.
    async fn serve(replies: Vec<(u16, &'static str)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                seen.push(request);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_skips_without_token_or_account() {
        let lines = test_token(&Token::default(), &target()).await.unwrap();
        assert_eq!(lines, vec!["No valid token provided - can't test"]);

        let lines = test_token(&Token::new("aad", None), &SmokeTarget::default())
            .await
            .unwrap();
        assert!(lines[0].contains("account id"));
    }

    #[tokio::test]
    async fn test_exchange_then_list_sessions() {
        let (base, server) = serve(vec![
            (200, r#"{"AccessToken":"sts-token-value"}"#),
            (200, r#"{"sessions":[{"id":"s1"},{"id":"s2"}]}"#),
        ])
        .await;
        let client = MixedRealityClient::with_endpoints(&base, &base);

        let lines = run_test(&client, &Token::new("aad-token", None), &target())
            .await
            .unwrap();

        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("(2 session(s))"));
        assert!(!lines[1].contains("sts-token-value"));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /accounts/acc-1/token "));
        assert!(requests[0].to_lowercase().contains("authorization: bearer aad-token"));
        assert!(requests[1].starts_with("GET /v1/accounts/acc-1/sessions "));
        assert!(requests[1]
            .to_lowercase()
            .contains("authorization: bearer sts-token-value"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_an_error() {
        let (base, _server) = serve(vec![(401, "{}")]).await;
        let client = MixedRealityClient::with_endpoints(&base, &base);

        let err = run_test(&client, &Token::new("aad", None), &target())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("401 Unauthorized"));
    }
}
