//! Client side of the version authority boundary
//!
//! [`SyncRemote`] is the seam the orchestrator talks through; [`ApiClient`]
//! implements it over HTTP with a bounded per-request timeout.

use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::api::{
    Ack, AssetContent, Machine, PushRequest, PushResponse, RegisterMachineRequest, SyncManifest,
    SyncReport,
};
use crate::error::{Result, SyncError};

/// Operations the orchestrator needs from the version authority
pub trait SyncRemote: Send + Sync {
    /// All assets visible to the caller plus this machine's sync state
    fn manifest(&self, machine_id: &str) -> impl Future<Output = Result<SyncManifest>> + Send;

    /// Current content and version of one asset
    fn asset_content(&self, asset_id: &str) -> impl Future<Output = Result<AssetContent>> + Send;

    /// Upload new content; the server bumps and returns the version
    fn push_content(
        &self,
        asset_id: &str,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushResponse>> + Send;

    /// Record a completed pull (or out-of-band sync) in the server ledger
    fn report_sync(&self, report: &SyncReport) -> impl Future<Output = Result<()>> + Send;

    fn register_machine(
        &self,
        request: &RegisterMachineRequest,
    ) -> impl Future<Output = Result<Machine>> + Send;
}

impl<T: SyncRemote> SyncRemote for Arc<T> {
    fn manifest(&self, machine_id: &str) -> impl Future<Output = Result<SyncManifest>> + Send {
        (**self).manifest(machine_id)
    }

    fn asset_content(&self, asset_id: &str) -> impl Future<Output = Result<AssetContent>> + Send {
        (**self).asset_content(asset_id)
    }

    fn push_content(
        &self,
        asset_id: &str,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushResponse>> + Send {
        (**self).push_content(asset_id, request)
    }

    fn report_sync(&self, report: &SyncReport) -> impl Future<Output = Result<()>> + Send {
        (**self).report_sync(report)
    }

    fn register_machine(
        &self,
        request: &RegisterMachineRequest,
    ) -> impl Future<Output = Result<Machine>> + Send {
        (**self).register_machine(request)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the version authority
#[derive(Clone, Debug)]
pub struct ApiClient {
    base: Url,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends with '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| SyncError::Config(format!("invalid API url {base_url:?}: {e}")))?;
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self { base, token, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid endpoint {path}: {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        debug!("Request failed with {}: {}", status, message);

        Err(match status {
            StatusCode::NOT_FOUND => SyncError::NotFound(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                SyncError::Validation(message)
            }
            other => SyncError::Remote {
                status: other.as_u16(),
                message,
            },
        })
    }
}

impl SyncRemote for ApiClient {
    async fn manifest(&self, machine_id: &str) -> Result<SyncManifest> {
        let mut url = self.endpoint("api/v1/sync/manifest")?;
        url.query_pairs_mut().append_pair("machineId", machine_id);
        self.send(self.http.get(url)).await
    }

    async fn asset_content(&self, asset_id: &str) -> Result<AssetContent> {
        let url = self.endpoint(&format!("api/v1/assets/{asset_id}/content"))?;
        self.send(self.http.get(url)).await
    }

    async fn push_content(&self, asset_id: &str, request: &PushRequest) -> Result<PushResponse> {
        let url = self.endpoint(&format!("api/v1/assets/{asset_id}/content"))?;
        self.send(self.http.put(url).json(request)).await
    }

    async fn report_sync(&self, report: &SyncReport) -> Result<()> {
        let url = self.endpoint("api/v1/sync/report")?;
        let _: Ack = self.send(self.http.post(url).json(report)).await?;
        Ok(())
    }

    async fn register_machine(&self, request: &RegisterMachineRequest) -> Result<Machine> {
        let url = self.endpoint("api/v1/machines")?;
        self.send(self.http.post(url).json(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = ApiClient::new(
            "https://market.example/sync",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("api/v1/machines").unwrap().as_str(),
            "https://market.example/sync/api/v1/machines"
        );
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = ApiClient::new("not a url", None, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        // Port 9 (discard) is essentially never listening
        let client = ApiClient::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = client.manifest("m1").await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);
    }
}
