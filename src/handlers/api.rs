//! Built-in `/apis` route: lists the registered routes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Handler, Params, RequestStream, SessionChannel};

/// Path the listing is served on.
pub const API_PATH: &str = "/apis";

pub struct ApiHandler {
    routes: Arc<[String]>,
}

impl ApiHandler {
    /// `routes` must already be sorted.
    pub fn new(routes: Arc<[String]>) -> Self {
        Self { routes }
    }

    fn listing(&self) -> String {
        let mut out = String::from("\nexecgate routes:\r\n");
        for route in self.routes.iter() {
            out.push_str(&format!("- {}\r\n", route));
        }
        out.push('\n');
        out
    }
}

#[async_trait]
impl Handler for ApiHandler {
    fn inject_parameters(&mut self, _params: Params) {}

    async fn handle(&mut self, channel: SessionChannel, _requests: RequestStream) {
        let SessionChannel { mut stream, control } = channel;
        if let Err(e) = stream.write_all(self.listing().as_bytes()).await {
            debug!("Failed to write route listing: {}", e);
        }
        let _ = stream.shutdown().await;
        control.close().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::handlers::PendingRequests;
    use crate::handlers::testing::{Event, RecordingControl};

    #[tokio::test]
    async fn test_lists_routes_and_closes() {
        let routes: Arc<[String]> = vec!["/apis".to_string(), "/echo".to_string()].into();
        let mut handler = ApiHandler::new(routes);

        let (stream, mut client) = tokio::io::duplex(1024);
        let control = Arc::new(RecordingControl::default());
        let (_tx, rx) = mpsc::channel(1);
        handler
            .handle(
                SessionChannel::new(stream, control.clone()),
                RequestStream::new(PendingRequests::new(1), rx),
            )
            .await;

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "\nexecgate routes:\r\n- /apis\r\n- /echo\r\n\n");
        assert_eq!(control.events(), [Event::Close]);
    }
}
