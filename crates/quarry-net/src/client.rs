use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    traits::{ByteStream, Net},
    types::NetOptions,
};

/// `reqwest`-backed [`Net`] implementation.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    /// # Panics
    ///
    /// Panics if the `reqwest::Client` builder fails to build.
    #[must_use]
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(NetOptions::default())
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn get_bytes(&self, url: Url) -> NetResult<Bytes> {
        let req = self.inner.get(url.clone()).timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url));
        }

        resp.bytes().await.map_err(NetError::from)
    }

    async fn stream(&self, url: Url) -> NetResult<ByteStream> {
        // No whole-request timeout for streaming: artifact downloads can take
        // arbitrary time. The caller's cancellation token bounds the transfer.
        let req = self.inner.get(url.clone());

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url));
        }

        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(Box::pin(stream))
    }
}
