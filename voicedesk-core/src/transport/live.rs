//! WebSocket connector for the hosted live agent.
//!
//! One spawned task owns both halves of the socket. It sends the setup
//! frame, then selects over three sources until one of them ends the
//! session: the shutdown signal, the outbound queue, and the socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::protocol::{parse_server_message, realtime_input_message, setup_message};
use super::{Connector, LiveSetup, OutboundQueue, TransportEvent, TransportHandle, EVENT_CHANNEL_CAP};

#[derive(Debug, Default, Clone)]
pub struct LiveConnector;

impl LiveConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for LiveConnector {
    fn connect(&self, setup: &LiveSetup, outbound: Arc<OutboundQueue>) -> TransportHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_connection(
            setup.clone(),
            Arc::clone(&outbound),
            events_tx,
            shutdown_rx,
        ));
        TransportHandle::new(outbound, events_rx, shutdown_tx, Some(task))
    }
}

async fn run_connection(
    setup: LiveSetup,
    outbound: Arc<OutboundQueue>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let setup_frame = match setup_message(&setup) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            return;
        }
    };

    info!(endpoint = %setup.endpoint, model = %setup.model, "connecting to live agent");
    let ws_stream = tokio::select! {
        _ = shutdown.changed() => {
            debug!("transport closed before connecting");
            return;
        }
        connected = tokio_tungstenite::connect_async(setup.url()) => match connected {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect live agent");
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        }
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();
    if let Err(e) = ws_write.send(WsMessage::Text(setup_frame)).await {
        error!(error = %e, "failed to send session setup");
        let _ = events.send(TransportEvent::Error(e.to_string())).await;
        return;
    }
    debug!("session setup sent");

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws_write.close().await;
                info!(sent, "live agent connection closed locally");
                break;
            }
            next = outbound.pop() => {
                let Some(chunk) = next else {
                    let _ = ws_write.close().await;
                    info!(sent, "outbound queue closed, ending connection");
                    break;
                };
                let frame = match realtime_input_message(&chunk, setup.input_sample_rate) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "failed to wrap outbound frame");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(WsMessage::Text(frame)).await {
                    error!(error = %e, "failed to send audio frame");
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
                sent += 1;
            }
            msg = ws_read.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "non-utf8 binary frame ignored");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_write.send(WsMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        info!(reason = ?reason, "live agent closed the connection");
                        let _ = events.send(TransportEvent::Closed(reason)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "live agent websocket error");
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        info!("live agent stream ended");
                        let _ = events.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                };

                match parse_server_message(&text) {
                    Ok(parsed) => {
                        for event in parsed {
                            if events.send(event).await.is_err() {
                                debug!("event receiver dropped, ending connection");
                                let _ = ws_write.close().await;
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse server message"),
                }
            }
        }
    }
    outbound.close();
}
