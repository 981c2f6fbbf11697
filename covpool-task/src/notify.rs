// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! External spreadsheet notification sink.
//!
//! The sink has an idempotent upsert-by-key contract: sending the same row
//! for the same report id twice converges to one row. Failures are reported
//! through [`NotifyResult`], never swallowed; the caller decides whether a
//! failed notification fails the surrounding publish.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry_notify, ExponentialBackoff};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::tasks::config::EffectiveConfig;

const NOTIFY_RETRY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct NotifyResult {
    pub ok: bool,
    pub error: Option<String>,
}

impl NotifyResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Upsert one spreadsheet row, keyed by report id.
    async fn upsert_row(&self, key: u64, fields: &BTreeMap<String, String>) -> NotifyResult;
}

/// No-op sink for deployments without a configured spreadsheet.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn upsert_row(&self, key: u64, _fields: &BTreeMap<String, String>) -> NotifyResult {
        debug!("no notification endpoint configured, skipping row {}", key);
        NotifyResult::success()
    }
}

/// HTTP spreadsheet sink with retry.
pub struct SheetNotifier {
    endpoint: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl SheetNotifier {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid notification endpoint: {}", endpoint))?;

        Ok(Self {
            endpoint,
            token,
            client: reqwest::Client::new(),
        })
    }

    async fn send(&self, key: u64, fields: &BTreeMap<String, String>) -> Result<()> {
        let body = serde_json::json!({
            "key": key,
            "fields": fields,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .context("notification send")?
            .error_for_status()
            .context("notification status")?;

        Ok(())
    }
}

#[async_trait]
impl Notifier for SheetNotifier {
    async fn upsert_row(&self, key: u64, fields: &BTreeMap<String, String>) -> NotifyResult {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(NOTIFY_RETRY_WINDOW),
            ..ExponentialBackoff::default()
        };

        let operation = || async {
            self.send(key, fields)
                .await
                .map_err(backoff::Error::transient)
        };

        let notify = |err, dur| {
            warn!("notification attempt failed, will retry in {:?}: {:?}", dur, err);
        };

        match retry_notify(backoff, operation, notify).await {
            Ok(()) => NotifyResult::success(),
            Err(err) => NotifyResult::failure(format!("{:#}", err)),
        }
    }
}

/// Build the sink for one request from its effective configuration.
pub fn notifier_for(config: &EffectiveConfig) -> Result<Box<dyn Notifier>> {
    match &config.notify_url {
        Some(url) => Ok(Box::new(SheetNotifier::new(url, config.notify_token.clone())?)),
        None => Ok(Box::new(NullNotifier)),
    }
}
