/// Transport seam for the upstream trade feed
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use crate::error::{FlowError, Result};

/// Text frames from one open connection. The stream ends when the server
/// closes; a transport error is yielded once and then the stream ends.
pub type FrameStream = BoxStream<'static, Result<String>>;

pub trait FeedConnector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>>;
}

/// WebSocket connector over tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl FeedConnector for TungsteniteConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url)
                .await
                .map_err(|e| FlowError::Transport(format!("Connection failed: {}", e)))?;

            let frames = stream::unfold(Some(ws_stream), |state| async move {
                let mut ws_stream = state?;
                loop {
                    match ws_stream.next().await {
                        Some(Ok(Message::Text(text))) => return Some((Ok(text), Some(ws_stream))),
                        Some(Ok(Message::Binary(data))) => {
                            let frame = String::from_utf8(data)
                                .map_err(|e| FlowError::Parse(format!("non-UTF-8 binary frame: {}", e)));
                            return Some((frame, Some(ws_stream)));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Server closed connection: {:?}", frame);
                            return None;
                        }
                        // Pings are answered by the library
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Some((Err(FlowError::Transport(format!("Receive failed: {}", e))), None))
                        }
                        None => return None,
                    }
                }
            });

            Ok(frames.boxed())
        })
    }
}
