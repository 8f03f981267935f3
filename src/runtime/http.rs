/// Outbound HTTP for webhook nodes
///
/// The engine only sees the `HttpClient` trait; `ReqwestHttpClient` is the
/// production implementation. Placeholders of the form `{{name}}` in the URL
/// and header values are filled from the instance variables before sending.

use crate::workflow::types::{Variables, WebhookAuth, WebhookConfig};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};

/// Response of a webhook call, as captured into variables
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, or the raw text when the body is not JSON
    pub body: Value,
    pub success: bool,
}

/// External collaborator performing webhook calls
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, config: &WebhookConfig, variables: &Variables) -> Result<HttpResponse>;
}

#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn call(&self, config: &WebhookConfig, variables: &Variables) -> Result<HttpResponse> {
        let url = interpolate(&config.url, variables);
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow::anyhow!("Unsupported HTTP method: {}", config.method))?;
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request_builder = self.client.request(method.clone(), &url).timeout(timeout);

        for (key, value) in &config.headers {
            request_builder = request_builder.header(key.as_str(), interpolate(value, variables));
        }

        request_builder = match &config.auth {
            Some(WebhookAuth::Bearer { token }) => request_builder.bearer_auth(token),
            Some(WebhookAuth::Basic { username, password }) => {
                request_builder.basic_auth(username, Some(password))
            }
            Some(WebhookAuth::ApiKey { header, value }) => {
                request_builder.header(header.as_str(), value.as_str())
            }
            None => request_builder,
        };

        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            let body = match &config.body {
                Some(body) => body.clone(),
                None => serde_json::to_value(variables)?,
            };
            request_builder = request_builder.json(&body);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body,
            success: status.is_success(),
        })
    }
}

/// Replace `{{name}}` placeholders with variable values. Strings are inserted
/// bare, other values as JSON; unknown names are left as they are.
pub fn interpolate(template: &str, variables: &Variables) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let name = after_open[..close].trim();
                match variables.get(name) {
                    Some(Value::String(s)) => output.push_str(s),
                    Some(value) => output.push_str(&value.to_string()),
                    None => output.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after_open[close + 2..];
            }
            None => {
                output.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}
