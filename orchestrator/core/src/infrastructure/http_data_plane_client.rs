// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for data plane workers.
//!
//! - `POST {url}/transfer` with a [`DataFlowRequest`] starts a flow and
//!   answers `{"handle": "..."}`
//! - `GET {url}/transfer/{handle}` answers `{"status": "running"}`,
//!   `{"status": "succeeded"}` or `{"status": "failed", "detail": "..."}`

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::domain::data_plane::{
    DataFlowHandle, DataFlowRequest, DataPlaneClient, DataPlaneError, DataPlaneInstance, TransferOutcome,
};
use crate::infrastructure::http_dispatch::is_rejection;

#[derive(Debug, Deserialize)]
struct StartFlowResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum FlowStatusResponse {
    Running,
    Succeeded,
    Failed {
        #[serde(default)]
        detail: String,
    },
}

pub struct HttpDataPlaneClient {
    client: Client,
}

impl HttpDataPlaneClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    /// Worker URL with `segments` appended; each segment is percent-encoded,
    /// so a handle can never change the request target.
    fn endpoint(instance: &DataPlaneInstance, segments: &[&str]) -> Result<Url, DataPlaneError> {
        let mut url = Url::parse(&instance.url)
            .map_err(|e| DataPlaneError::Rejected(format!("invalid data plane url {}: {}", instance.url, e)))?;
        url.path_segments_mut()
            .map_err(|_| DataPlaneError::Rejected(format!("data plane url {} cannot carry a path", instance.url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response, DataPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} {}", status, body).trim().to_string();
        if is_rejection(status) {
            Err(DataPlaneError::Rejected(detail))
        } else {
            Err(DataPlaneError::Unavailable(detail))
        }
    }
}

#[async_trait]
impl DataPlaneClient for HttpDataPlaneClient {
    async fn start(
        &self,
        instance: &DataPlaneInstance,
        request: &DataFlowRequest,
    ) -> Result<DataFlowHandle, DataPlaneError> {
        let url = Self::endpoint(instance, &["transfer"])?;
        debug!(process_id = %request.process_id, url = %url, "Starting data flow");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| DataPlaneError::Unavailable(e.to_string()))?;
        let response = Self::check(response).await?;

        let body: StartFlowResponse = response
            .json()
            .await
            .map_err(|e| DataPlaneError::Unavailable(format!("invalid start response: {}", e)))?;
        Ok(DataFlowHandle(body.handle))
    }

    async fn poll(
        &self,
        instance: &DataPlaneInstance,
        handle: &DataFlowHandle,
    ) -> Result<Option<TransferOutcome>, DataPlaneError> {
        let url = Self::endpoint(instance, &["transfer", handle.0.as_str()])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DataPlaneError::Unavailable(e.to_string()))?;
        let response = Self::check(response).await?;

        let status: FlowStatusResponse = response
            .json()
            .await
            .map_err(|e| DataPlaneError::Unavailable(format!("invalid status response: {}", e)))?;
        Ok(match status {
            FlowStatusResponse::Running => None,
            FlowStatusResponse::Succeeded => Some(TransferOutcome::Succeeded),
            FlowStatusResponse::Failed { detail } => Some(TransferOutcome::Failed { detail }),
        })
    }
}
