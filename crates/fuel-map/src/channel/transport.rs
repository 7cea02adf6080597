//! Byte-stream transports for the live update channel

use crate::ChannelError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::time::Duration;

/// Raw chunks of an open connection, in arrival order
pub type ByteStream = BoxStream<'static, Result<Bytes, ChannelError>>;

/// Opens one-way push connections to the update source
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection
    ///
    /// `last_event_id` is the id of the last event received on a previous
    /// connection, so the server can replay what was missed.
    fn connect(&self, last_event_id: Option<String>)
    -> BoxFuture<'static, Result<ByteStream, ChannelError>>;
}

/// Server-Sent Events over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn connect(
        &self,
        last_event_id: Option<String>,
    ) -> BoxFuture<'static, Result<ByteStream, ChannelError>> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }

        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ChannelError::Status(status.as_u16()));
            }
            Ok(response.bytes_stream().map_err(ChannelError::from).boxed())
        }
        .boxed()
    }
}
