use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use fanwatch_common::{codec, DeviceState, Directive};

use crate::services::{DeviceError, DeviceTransport};

/// Talks to fans over their `fanspd.cgi` endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build device http client")?;
        Ok(Self { client })
    }
}

pub fn directive_url(ip_address: &str, directive: Directive) -> String {
    format!("http://{ip_address}/fanspd.cgi?dir={}", directive.code())
}

fn classify(err: reqwest::Error) -> DeviceError {
    if err.is_timeout() {
        DeviceError::Timeout
    } else if err.is_builder() {
        DeviceError::BadUrl(err.to_string())
    } else {
        DeviceError::Network(err.to_string())
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn send(
        &self,
        ip_address: &str,
        directive: Directive,
    ) -> Result<DeviceState, DeviceError> {
        let url = directive_url(ip_address, directive);
        debug!("device request {url}");

        let response = self.client.get(&url).send().await.map_err(classify)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DeviceError::Server(status.as_u16()));
        }

        let body = response.text().await.map_err(classify)?;
        let mut state = codec::decode(&body)?;
        // Replies carry whatever address the fan believes it has; key state by the one we used.
        state.ip_address = ip_address.to_string();
        Ok(state)
    }
}
