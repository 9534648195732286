//! Websocket `tm.event='NewBlock'` subscription.
//!
//! One connection per subscription. The background task forwards blocks
//! until the subscriber goes away (then it unsubscribes and closes the
//! socket) or the connection fails (then it reports the failure and ends the
//! feed). It does not reconnect.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use chainstream_core::{BlockSubscription, StreamError, SubscriptionSender};

use crate::rpc::{parse_ws_frame, WsFrame};

pub const NEW_BLOCK_QUERY: &str = "tm.event='NewBlock'";

fn subscribe_request() -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "subscribe",
        "id": 1,
        "params": { "query": NEW_BLOCK_QUERY }
    })
    .to_string()
}

fn unsubscribe_request() -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "unsubscribe_all",
        "id": 2,
        "params": {}
    })
    .to_string()
}

/// Open a websocket to `url` and subscribe to new blocks.
///
/// The handshake and the subscribe request each get `timeout`.
pub async fn subscribe_new_blocks(
    url: &str,
    buffer: usize,
    timeout: Duration,
) -> Result<BlockSubscription, StreamError> {
    let timed_out = |step: &str| {
        StreamError::Transport(format!(
            "websocket {step} {url}: timed out after {}ms",
            timeout.as_millis()
        ))
    };

    let (socket, _) = time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| timed_out("connect"))?
        .map_err(|e| StreamError::Transport(format!("websocket connect {url}: {e}")))?;
    let (mut sink, mut stream) = socket.split();

    time::timeout(timeout, sink.send(Message::Text(subscribe_request())))
        .await
        .map_err(|_| timed_out("subscribe"))?
        .map_err(|e| StreamError::Transport(format!("websocket subscribe: {e}")))?;
    tracing::info!(%url, query = NEW_BLOCK_QUERY, "subscribed to new blocks");

    let (tx, subscription) = BlockSubscription::channel(buffer.max(1));
    let url = url.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    let _ = sink.send(Message::Text(unsubscribe_request())).await;
                    let _ = sink.close().await;
                    tracing::info!(%url, "new-block subscription closed");
                    return;
                }
                msg = stream.next() => {
                    if !forward(msg, &tx, &url).await {
                        return;
                    }
                }
            }
        }
    });

    Ok(subscription)
}

/// Handle one websocket message. Returns `false` when the feed is over.
async fn forward(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    tx: &SubscriptionSender,
    url: &str,
) -> bool {
    match msg {
        None | Some(Ok(Message::Close(_))) => {
            tracing::warn!(%url, "websocket closed by node");
            // Dropping the sender ends the feed.
            false
        }
        Some(Err(e)) => {
            tracing::warn!(%url, error = %e, "websocket receive error");
            tx.send(Err(StreamError::Transport(format!("websocket: {e}")))).await;
            false
        }
        Some(Ok(Message::Text(text))) => match parse_ws_frame(&text) {
            Ok(WsFrame::NewBlock(block)) => {
                tracing::trace!(height = block.height, "new block");
                tx.send(Ok(block)).await
            }
            Ok(WsFrame::Other) => true,
            Err(e) => {
                tx.send(Err(e)).await;
                false
            }
        },
        Some(Ok(_)) => true,
    }
}
