// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Compute Engine REST v1 client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::ComputeApiPort;
use crate::app::types::{CloudImage, CloudInstance, FirewallRule, ZoneOperation};

pub const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY: usize = 512;

pub struct GcpComputeClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl GcpComputeClient {
    pub fn new(access_token: impl Into<String>, base_url: impl Into<String>) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    /// Reads the bearer token from the environment variable `var`.
    pub fn from_env(var: &str) -> AppResult<Self> {
        let token = std::env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                AppError::configuration(format!("environment variable {var} holds no access token"))
            })?;
        Self::new(token.trim(), DEFAULT_BASE_URL)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> AppResult<Value> {
        let url = self.url(path);
        tracing::debug!(%method, %url, "compute api request");
        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.access_token)
            .query(query);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| {
            AppError::with_message(
                AppErrorKind::Unavailable,
                codes::NETWORK_ERROR,
                format!("compute api request failed: {e}"),
            )
            .with_context(url.clone())
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            AppError::with_message(
                AppErrorKind::Unavailable,
                codes::NETWORK_ERROR,
                format!("failed to read compute api response: {e}"),
            )
        })?;
        if !status.is_success() {
            return Err(map_status(status, &text).with_context(url));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!("invalid compute api response: {e}"),
            )
        })
    }

    /// Follows `nextPageToken` and concatenates every page's `items`.
    async fn list_items(&self, path: &str, filter: Option<&str>) -> AppResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = Vec::new();
            if let Some(filter) = filter {
                query.push(("filter", filter));
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page = self.request(Method::GET, path, &query, None).await?;
            if let Some(page_items) = page["items"].as_array() {
                items.extend(page_items.iter().cloned());
            }
            match page["nextPageToken"].as_str() {
                Some(next) if !next.is_empty() => page_token = Some(next.to_string()),
                _ => return Ok(items),
            }
        }
    }
}

fn map_status(status: StatusCode, body: &str) -> AppError {
    let message = api_error_message(body).unwrap_or_else(|| truncate(body));
    let (kind, code) = match status {
        StatusCode::NOT_FOUND => (AppErrorKind::NotFound, codes::NOT_FOUND),
        StatusCode::CONFLICT => (AppErrorKind::Conflict, codes::CONFLICT),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            (AppErrorKind::FailedPrecondition, codes::REMOTE_ERROR)
        }
        StatusCode::BAD_REQUEST => (AppErrorKind::InvalidArgument, codes::REMOTE_ERROR),
        _ => (AppErrorKind::Unavailable, codes::REMOTE_ERROR),
    };
    AppError::with_message(kind, code, format!("compute api returned {status}: {message}"))
}

fn api_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed["error"]["message"].as_str().map(str::to_string)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

fn operation_name(value: &Value) -> AppResult<String> {
    value["name"].as_str().map(str::to_string).ok_or_else(|| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::REMOTE_ERROR,
            "compute api response carries no operation name",
        )
    })
}

/// Last path segment of a resource URL (`.../zones/us-east1-b` -> `us-east1-b`).
fn short_name(value: &Value) -> Option<String> {
    value
        .as_str()
        .and_then(|s| s.rsplit('/').next())
        .map(str::to_string)
}

fn parse_instance(item: &Value, zone: &str) -> Option<CloudInstance> {
    let name = item["name"].as_str()?.to_string();
    let nic = &item["networkInterfaces"][0];
    let labels = item["labels"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Some(CloudInstance {
        name,
        zone: short_name(&item["zone"]).unwrap_or_else(|| zone.to_string()),
        status: item["status"].as_str().unwrap_or("UNKNOWN").to_string(),
        labels,
        internal_ip: nic["networkIP"].as_str().map(str::to_string),
        external_ip: nic["accessConfigs"][0]["natIP"].as_str().map(str::to_string),
    })
}

fn parse_image(item: &Value) -> Option<CloudImage> {
    Some(CloudImage {
        name: item["name"].as_str()?.to_string(),
        family: item["family"].as_str().map(str::to_string),
    })
}

fn parse_operation(value: Value) -> AppResult<ZoneOperation> {
    let name = operation_name(&value)?;
    let done = value["status"].as_str() == Some("DONE");
    let error = value.get("error").filter(|e| !e.is_null()).cloned();
    Ok(ZoneOperation {
        name,
        done,
        error,
        raw: value,
    })
}

#[async_trait]
impl ComputeApiPort for GcpComputeClient {
    async fn list_firewalls(&self, project: &str) -> AppResult<Vec<FirewallRule>> {
        let items = self
            .list_items(&format!("projects/{project}/global/firewalls"), None)
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<FirewallRule>(item) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unparseable firewall rule");
                    None
                }
            })
            .collect())
    }

    async fn insert_firewall(&self, project: &str, rule: &FirewallRule) -> AppResult<String> {
        let body = serde_json::to_value(rule).map_err(|e| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                format!("failed to encode firewall rule: {e}"),
            )
        })?;
        let op = self
            .request(
                Method::POST,
                &format!("projects/{project}/global/firewalls"),
                &[],
                Some(&body),
            )
            .await?;
        operation_name(&op)
    }

    async fn list_instances(&self, project: &str, zone: &str) -> AppResult<Vec<CloudInstance>> {
        let items = self
            .list_items(&format!("projects/{project}/zones/{zone}/instances"), None)
            .await?;
        Ok(items
            .iter()
            .filter_map(|item| parse_instance(item, zone))
            .collect())
    }

    async fn insert_instance(&self, project: &str, zone: &str, body: &Value) -> AppResult<String> {
        let op = self
            .request(
                Method::POST,
                &format!("projects/{project}/zones/{zone}/instances"),
                &[],
                Some(body),
            )
            .await?;
        operation_name(&op)
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> AppResult<String> {
        let op = self
            .request(
                Method::DELETE,
                &format!("projects/{project}/zones/{zone}/instances/{name}"),
                &[],
                None,
            )
            .await?;
        operation_name(&op)
    }

    async fn list_images(&self, project: &str) -> AppResult<Vec<CloudImage>> {
        let items = self
            .list_items(&format!("projects/{project}/global/images"), None)
            .await?;
        Ok(items.iter().filter_map(parse_image).collect())
    }

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> AppResult<ZoneOperation> {
        let value = self
            .request(
                Method::GET,
                &format!("projects/{project}/zones/{zone}/operations/{operation}"),
                &[],
                None,
            )
            .await?;
        parse_operation(value)
    }
}
