//! WebSocket upgrade and the per-viewer relay pair.
//!
//! Each viewer gets two tasks: a reader that forwards control messages to the
//! hub and a writer that drains the viewer's outbound queue onto the socket.
//! Neither touches hub state; when either ends, the other is torn down and
//! the viewer is unregistered.

use std::fmt::Display;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::debug;

use crate::hub::{Frame, HubHandle, VIEWER_QUEUE};
use crate::state::AppState;

/// Inbound frames larger than this are rejected by the socket.
pub const MAX_MESSAGE_BYTES: usize = 512;
/// Any inbound frame, pongs included, must arrive within this window.
pub const READ_WAIT: Duration = Duration::from_secs(60);
/// Keep-alive period; shorter than [`READ_WAIT`] so the peer's pong lands in time.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_viewer(socket, hub))
}

async fn serve_viewer(socket: WebSocket, hub: HubHandle) {
    let (queue_tx, queue_rx) = mpsc::channel(VIEWER_QUEUE);
    let id = match hub.register(queue_tx).await {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "viewer rejected");
            return;
        }
    };
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_relay(sink, queue_rx, PING_PERIOD));
    let mut reader = tokio::spawn(read_relay(stream, hub.clone(), READ_WAIT));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    hub.unregister(id).await;
    debug!(%id, "viewer disconnected");
}

/// Drain the viewer's queue onto the socket. A closed queue turns into a
/// close frame; an idle connection gets a ping every `ping_period`.
pub async fn write_relay<S>(mut sink: S, mut queue: mpsc::Receiver<Frame>, ping_period: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut keepalive = interval_at(Instant::now() + ping_period, ping_period);
    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if !send(&mut sink, Message::Text(frame.to_string())).await {
                        return;
                    }
                    keepalive.reset();
                }
                None => {
                    send(&mut sink, Message::Close(None)).await;
                    return;
                }
            },
            _ = keepalive.tick() => {
                if !send(&mut sink, Message::Ping(Vec::new())).await {
                    return;
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, msg: Message) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "viewer write failed");
            false
        }
        Err(_) => {
            debug!("viewer write deadline passed");
            false
        }
    }
}

/// Forward text frames to the hub until the peer goes away or stays silent
/// past `read_wait`.
pub async fn read_relay<R, E>(mut stream: R, hub: HubHandle, read_wait: Duration)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match timeout(read_wait, stream.next()).await {
            Err(_) => {
                debug!("viewer read deadline passed");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "viewer read failed");
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if !hub.forward(text) {
                    debug!("hub inbox full, control message dropped");
                }
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::sync::Arc;

    #[tokio::test]
    async fn closed_queue_sends_close_frame() {
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::from("{\"x\":1}")).await.unwrap();
        drop(tx);
        write_relay(sink, rx, Duration::from_secs(60)).await;

        match out.next().await {
            Some(Message::Text(t)) => assert_eq!(t, "{\"x\":1}"),
            other => panic!("expected text frame, got {other:?}"),
        }
        assert!(matches!(out.next().await, Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_writer_pings() {
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Frame>(4);
        let relay = tokio::spawn(write_relay(sink, rx, Duration::from_secs(54)));

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert!(matches!(out.next().await, Some(Message::Ping(_))));
        drop(tx);
        relay.await.unwrap();
    }
}
