//! Controller REST client
//!
//! Every call goes through [`ControllerClient::invoke_api`], which adds the
//! request ID and content type headers, enforces the per-request deadline
//! and writes the exchange to the audit log.

use crate::error::ClientError;
use crate::tls::TlsConfig;
use crate::controller_trait::ControllerClientTrait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use storage_core::api::{AddNodeResponse, ErrorResponse, ListNodesResponse, GetChapResponse, VolumePublicationUpdate};
use storage_core::{ChapCredentials, Node, current_request_id};
use tracing::debug;

/// Base path of the versioned controller API.
pub const API_BASE_PATH: &str = "/trident/v1";

/// Per-request deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the request correlation ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

const REDACTED: &str = "<REDACTED>";

/// Client for the controller REST API
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: Client,
    base_url: String,
}

impl ControllerClient {
    /// Create a client for the controller at `host:port`
    ///
    /// With `tls` the client speaks HTTPS and verifies the controller as
    /// described in [`TlsConfig`]; without it, plain HTTP.
    pub fn new(host: &str, port: u16, tls: Option<&TlsConfig>) -> Result<Self, ClientError> {
        let builder = Client::builder().timeout(REQUEST_TIMEOUT);

        let (client, base_url) = match tls {
            Some(tls) => {
                let client = tls.apply(builder, host, port)?.build()?;
                (client, format!("https://{}:{port}{API_BASE_PATH}", tls.url_host(host)))
            }
            None => (builder.build()?, format!("http://{host}:{port}{API_BASE_PATH}")),
        };

        Ok(Self { client, base_url })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one request to the controller.
    ///
    /// Returns the status and raw body for any HTTP response; only transport
    /// failures are errors here. Bodies are logged pretty-printed unless the
    /// matching redact flag is set.
    pub async fn invoke_api(
        &self,
        body: Option<Vec<u8>>,
        method: Method,
        path: &str,
        redact_request: bool,
        redact_response: bool,
    ) -> Result<(StatusCode, Vec<u8>), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let request_id = current_request_id();

        debug!(
            target: "audit",
            request_id = %request_id,
            method = %method,
            url = %url,
            body = %loggable(body.as_deref(), redact_request),
            "Controller API request"
        );

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(REQUEST_ID_HEADER, &request_id)
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?.to_vec();

        debug!(
            target: "audit",
            request_id = %request_id,
            method = %method,
            url = %url,
            status = status.as_u16(),
            body = %loggable(Some(&bytes), redact_response),
            "Controller API response"
        );

        Ok((status, bytes))
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&T>,
        success: &[u16],
        redact_response: bool,
    ) -> Result<Vec<u8>, ClientError> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let (status, bytes) = self
            .invoke_api(body, method, path, false, redact_response)
            .await
            .map_err(|e| match e {
                ClientError::Connection(cause) => ClientError::Connection(format!("{operation}: {cause}")),
                other => other,
            })?;

        if success.contains(&status.as_u16()) {
            return Ok(bytes);
        }

        let message = serde_json::from_slice::<ErrorResponse>(&bytes)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        Err(ClientError::Api {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    fn parse<T: DeserializeOwned>(operation: &str, bytes: &[u8]) -> Result<T, ClientError> {
        serde_json::from_slice(bytes).map_err(|source| ClientError::Parse {
            operation: operation.to_string(),
            source,
        })
    }

    /// Register or update a node
    pub async fn create_node(&self, node: &Node) -> Result<AddNodeResponse, ClientError> {
        const OP: &str = "could not add node";
        let path = format!("/node/{}", urlencoding::encode(&node.name));
        let bytes = self.call(OP, Method::PUT, &path, Some(node), &[200, 201], false).await?;
        Self::parse(OP, &bytes)
    }

    /// Names of all registered nodes
    pub async fn list_nodes(&self) -> Result<Vec<String>, ClientError> {
        const OP: &str = "could not list nodes";
        let bytes = self.call::<()>(OP, Method::GET, "/node", None, &[200, 201], false).await?;
        Ok(Self::parse::<ListNodesResponse>(OP, &bytes)?.nodes)
    }

    /// Remove a node
    ///
    /// A node that is already gone, being removed, or unknown counts as
    /// deleted, so callers never retry forever.
    pub async fn delete_node(&self, name: &str) -> Result<(), ClientError> {
        const OP: &str = "could not delete node";
        let path = format!("/node/{}", urlencoding::encode(name));
        self.call::<()>(OP, Method::DELETE, &path, None, &[200, 204, 404, 410, 422], false)
            .await?;
        Ok(())
    }

    /// CHAP credentials for a volume on a node; never logged
    pub async fn get_chap(&self, volume: &str, node: &str) -> Result<ChapCredentials, ClientError> {
        const OP: &str = "could not get CHAP info";
        let path = format!("/chap/{}/{}", urlencoding::encode(volume), urlencoding::encode(node));
        let bytes = self.call::<()>(OP, Method::GET, &path, None, &[200], true).await?;
        Ok(Self::parse::<GetChapResponse>(OP, &bytes)?.chap)
    }

    /// Update node-reported publication flags
    pub async fn update_volume_publication(
        &self,
        volume: &str,
        node: &str,
        update: &VolumePublicationUpdate,
    ) -> Result<(), ClientError> {
        const OP: &str = "could not update volume publication";
        let path = format!("/publication/{}/{}", urlencoding::encode(volume), urlencoding::encode(node));
        self.call(OP, Method::PUT, &path, Some(update), &[200, 202], false).await?;
        Ok(())
    }

    /// Replace the ordered list of LUKS passphrase names for a volume
    pub async fn update_volume_luks_passphrase_names(&self, volume: &str, names: &[String]) -> Result<(), ClientError> {
        const OP: &str = "could not update volume LUKS passphrase names";
        let path = format!("/volume/{}/luksPassphraseNames", urlencoding::encode(volume));
        self.call(OP, Method::PUT, &path, Some(names), &[200, 202], false).await?;
        Ok(())
    }
}

fn loggable(body: Option<&[u8]>, redact: bool) -> String {
    match body {
        None => String::new(),
        Some(_) if redact => REDACTED.to_string(),
        Some(bytes) => serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[async_trait::async_trait]
impl ControllerClientTrait for ControllerClient {
    async fn create_node(&self, node: &Node) -> Result<AddNodeResponse, ClientError> {
        ControllerClient::create_node(self, node).await
    }

    async fn list_nodes(&self) -> Result<Vec<String>, ClientError> {
        ControllerClient::list_nodes(self).await
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClientError> {
        ControllerClient::delete_node(self, name).await
    }

    async fn get_chap(&self, volume: &str, node: &str) -> Result<ChapCredentials, ClientError> {
        ControllerClient::get_chap(self, volume, node).await
    }

    async fn update_volume_publication(
        &self,
        volume: &str,
        node: &str,
        update: &VolumePublicationUpdate,
    ) -> Result<(), ClientError> {
        ControllerClient::update_volume_publication(self, volume, node, update).await
    }

    async fn update_volume_luks_passphrase_names(&self, volume: &str, names: &[String]) -> Result<(), ClientError> {
        ControllerClient::update_volume_luks_passphrase_names(self, volume, names).await
    }
}
