use crate::config::StoreConfig;
use crate::transport::TransportError;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::env;
use std::time::Duration;

/// Minimal Redis-over-REST command client.
pub struct RestCommandClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl RestCommandClient {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let (base_url, token) = match (&config.rest_url, &config.rest_token) {
            (Some(url), Some(token)) => (url.trim_end_matches('/').to_string(), token.clone()),
            _ => {
                return Err(Error::configuration_with_context(
                    "shared store endpoint and token are both required",
                    ErrorContext::new()
                        .with_field_path("store.rest_url")
                        .with_source("rest_client"),
                ))
            }
        };
        let timeout = config.timeout();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(
                env::var("SHIELD_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(16),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self {
            client,
            base_url,
            token,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one command (e.g. `["GET", "key"]`) and returns its `result`.
    ///
    /// The whole round trip is bounded by the configured store timeout, on
    /// top of reqwest's own timeout, since this call sits on hot paths.
    pub async fn command(&self, args: &[Value]) -> std::result::Result<Value, TransportError> {
        let request = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(args)
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        let body: Value = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| {
                if e.is_timeout() {
                    self.timed_out()
                } else {
                    TransportError::Decode(e.to_string())
                }
            })?;

        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(if status.is_success() {
                TransportError::Store(err.to_string())
            } else {
                TransportError::Http {
                    status: Some(status.as_u16()),
                    message: err.to_string(),
                }
            });
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: Some(status.as_u16()),
                message: body.to_string(),
            });
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| TransportError::Decode(format!("missing result field: {}", body)))
    }

    fn timed_out(&self) -> TransportError {
        TransportError::Timeout {
            after_ms: Some(self.timeout.as_millis() as u64),
        }
    }

    /// Runs a Lua script server-side.
    pub async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<Value, TransportError> {
        let mut command = Vec::with_capacity(3 + keys.len() + args.len());
        command.push(Value::from("EVAL"));
        command.push(Value::from(script));
        command.push(Value::from(keys.len()));
        command.extend(keys.iter().map(|k| Value::from(k.as_str())));
        command.extend(args.iter().map(|a| Value::from(a.as_str())));
        self.command(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_url_and_token() {
        let config = StoreConfig {
            rest_url: Some("https://store.example.com".into()),
            rest_token: None,
            ..StoreConfig::default()
        };
        assert!(matches!(
            RestCommandClient::new(&config),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer secret")
            .match_body(mockito::Matcher::Json(serde_json::json!(["GET", "k"])))
            .with_status(200)
            .with_body(r#"{"result":"v"}"#)
            .create_async()
            .await;

        let config = StoreConfig {
            rest_url: Some(format!("{}/", server.url())),
            rest_token: Some("secret".into()),
            ..StoreConfig::default()
        };
        let client = RestCommandClient::new(&config).unwrap();
        let out = client
            .command(&[Value::from("GET"), Value::from("k")])
            .await
            .unwrap();
        assert_eq!(out, Value::from("v"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_timeout_reports_configured_bound() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let config = StoreConfig {
            rest_url: Some(format!("http://{}", addr)),
            rest_token: Some("secret".into()),
            timeout_ms: 100,
            ..StoreConfig::default()
        };
        let client = RestCommandClient::new(&config).unwrap();
        let err = client.command(&[Value::from("PING")]).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout { after_ms: Some(100) }));
        assert_eq!(err.to_string(), "request timed out after 100ms");
    }

    #[tokio::test]
    async fn test_store_error_reply() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"error":"WRONGPASS invalid token"}"#)
            .create_async()
            .await;

        let config = StoreConfig {
            rest_url: Some(server.url()),
            rest_token: Some("bad".into()),
            ..StoreConfig::default()
        };
        let client = RestCommandClient::new(&config).unwrap();
        let err = client.command(&[Value::from("PING")]).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
    }
}
