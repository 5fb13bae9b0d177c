// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Dispatch Gateway
//!
//! Posts [`RemoteMessage`]s as JSON to the counterparty's connector address.
//! One request per call; the orchestrator owns retries.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Outbound transport behind `DispatchGateway`

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::domain::dispatch::{DispatchError, DispatchGateway, RemoteMessage};

pub struct HttpDispatchGateway {
    client: Client,
}

impl HttpDispatchGateway {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

/// 4xx means the counterparty understood and refused; anything else may pass
/// on a later attempt.
pub(crate) fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl DispatchGateway for HttpDispatchGateway {
    async fn send(&self, message: &RemoteMessage) -> Result<(), DispatchError> {
        debug!(
            process_id = %message.process_id,
            kind = ?message.kind,
            address = %message.connector_address,
            "Dispatching message"
        );

        let response = self
            .client
            .post(&message.connector_address)
            .json(message)
            .send()
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} {}", status, body).trim().to_string();
        if is_rejection(status) {
            Err(DispatchError::Rejected(detail))
        } else {
            Err(DispatchError::Transient(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dispatch::RemoteMessageKind;
    use crate::domain::transfer::tests::sample_request;
    use crate::domain::transfer::{TransferProcess, TransferProcessType};

    fn message(address: String) -> RemoteMessage {
        let mut request = sample_request();
        request.connector_address = address;
        let process = TransferProcess::new(TransferProcessType::Consumer, request).unwrap();
        RemoteMessage::for_process(RemoteMessageKind::TransferRequest, &process)
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let accepted = server.mock("POST", "/ok").with_status(202).create_async().await;
        let _refused = server.mock("POST", "/refused").with_status(409).with_body("duplicate").create_async().await;
        let _down = server.mock("POST", "/down").with_status(503).create_async().await;

        let gateway = HttpDispatchGateway::new(Duration::from_secs(5)).unwrap();

        gateway.send(&message(format!("{}/ok", server.url()))).await.unwrap();
        accepted.assert_async().await;

        match gateway.send(&message(format!("{}/refused", server.url()))).await {
            Err(DispatchError::Rejected(detail)) => assert!(detail.contains("duplicate")),
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert!(matches!(
            gateway.send(&message(format!("{}/down", server.url()))).await,
            Err(DispatchError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_counterparty_is_transient() {
        let gateway = HttpDispatchGateway::new(Duration::from_millis(500)).unwrap();
        let result = gateway.send(&message("http://127.0.0.1:9/protocol".to_string())).await;
        assert!(matches!(result, Err(DispatchError::Transient(_))));
    }

    #[test]
    fn test_retryable_client_errors() {
        assert!(is_rejection(StatusCode::BAD_REQUEST));
        assert!(!is_rejection(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_rejection(StatusCode::BAD_GATEWAY));
    }
}
