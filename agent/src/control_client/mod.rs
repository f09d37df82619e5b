use anyhow::Context;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{HeartbeatResponse, RegisterNodeRequest, RegisterNodeResponse, ResourceReport};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The control plane no longer knows this node id.
    #[error("node {0} is not registered")]
    UnknownNode(String),

    #[error("{what} rejected ({status}): {body}")]
    Rejected {
        what: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{what} failed: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

pub struct ControlClient {
    base_url: String,
    client: Client,
}

impl ControlClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Register this node, or refresh the registration of the same hardware
    pub async fn register_node(
        &self,
        req: &RegisterNodeRequest,
    ) -> Result<RegisterNodeResponse, ClientError> {
        let url = self.url("/nodes/register");
        info!("Registering node at {}", url);

        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                what: "registration",
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                what: "registration",
                status,
                body,
            });
        }

        let result = resp
            .json::<RegisterNodeResponse>()
            .await
            .map_err(|source| ClientError::Transport {
                what: "registration response",
                source,
            })?;

        info!(
            "Node registered: node_id={}, created={}",
            result.node_id, result.created
        );
        Ok(result)
    }

    /// Send a heartbeat with the latest resource report
    pub async fn heartbeat(
        &self,
        node_id: &str,
        report: &ResourceReport,
    ) -> Result<HeartbeatResponse, ClientError> {
        let url = self.url(&format!("/nodes/{}/heartbeat", node_id));
        debug!("Sending heartbeat to {}", url);

        let resp = self
            .client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                what: "heartbeat",
                source,
            })?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ClientError::UnknownNode(node_id.to_string())),
            status if !status.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                Err(ClientError::Rejected {
                    what: "heartbeat",
                    status,
                    body,
                })
            }
            _ => resp
                .json::<HeartbeatResponse>()
                .await
                .map_err(|source| ClientError::Transport {
                    what: "heartbeat response",
                    source,
                }),
        }
    }
}
