use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::error::NetError;

/// Stream of body chunks from a single HTTP response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

/// Transport abstraction over HTTP GET.
///
/// This is the seam the downloader is tested through: production code uses
/// [`HttpClient`](crate::HttpClient), tests substitute a scripted fake.
#[async_trait]
pub trait Net: Send + Sync {
    /// Fetch the whole body into memory. Intended for small resources.
    async fn get_bytes(&self, url: Url) -> Result<Bytes, NetError>;

    /// Open a streaming GET. Large artifact transfers go through this;
    /// the caller drains the stream and owns cancellation.
    async fn stream(&self, url: Url) -> Result<ByteStream, NetError>;
}

/// Delegation so a shared transport can be handed around by handle.
#[async_trait]
impl<T: Net + ?Sized> Net for Arc<T> {
    async fn get_bytes(&self, url: Url) -> Result<Bytes, NetError> {
        (**self).get_bytes(url).await
    }

    async fn stream(&self, url: Url) -> Result<ByteStream, NetError> {
        (**self).stream(url).await
    }
}
