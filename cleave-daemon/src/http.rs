//! HTTP implementation of `ShardClient` over blocking reqwest.

use std::time::Duration;

use cleave_core::errors::ClientError;
use cleave_core::traits::client::{Headers, ShardClient};
use cleave_core::traits::ring::RingDevice;

/// Talks to container servers directly (PUT) and through the proxy tier (GET).
pub struct HttpShardClient {
    client: reqwest::blocking::Client,
    proxy_base_url: String,
    node_timeout: Duration,
}

impl HttpShardClient {
    pub fn new(
        proxy_base_url: impl Into<String>,
        conn_timeout: Duration,
        node_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(conn_timeout)
            .timeout(node_timeout)
            .build()
            .map_err(|e| ClientError::Transport { message: e.to_string() })?;
        Ok(Self { client, proxy_base_url: proxy_base_url.into(), node_timeout })
    }

    fn map_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout { seconds: self.node_timeout.as_secs_f64() }
        } else {
            ClientError::Transport { message: e.to_string() }
        }
    }

    fn check_status(response: &reqwest::blocking::Response) -> Result<(), ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status { status: status.as_u16() })
        }
    }
}

impl ShardClient for HttpShardClient {
    fn put_container(
        &self,
        node: &RingDevice,
        part: u32,
        account: &str,
        container: &str,
        request_headers: &Headers,
        body: &[u8],
    ) -> Result<(), ClientError> {
        let url = format!(
            "http://{}:{}/{}/{}/{}/{}",
            node.ip, node.port, node.device, part, account, container
        );
        let mut request = self.client.put(url).body(body.to_vec());
        for (key, value) in request_headers {
            request = request.header(key, value);
        }
        let response = request.send().map_err(|e| self.map_error(e))?;
        Self::check_status(&response)
    }

    fn get_container(
        &self,
        account: &str,
        container: &str,
        request_headers: &Headers,
    ) -> Result<Vec<u8>, ClientError> {
        let url = format!(
            "{}/v1/{}/{}?format=json",
            self.proxy_base_url.trim_end_matches('/'),
            account,
            container
        );
        let mut request = self.client.get(url);
        for (key, value) in request_headers {
            request = request.header(key, value);
        }
        let response = request.send().map_err(|e| self.map_error(e))?;
        Self::check_status(&response)?;
        let bytes = response.bytes().map_err(|e| self.map_error(e))?;
        Ok(bytes.to_vec())
    }
}
