use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;
use log::{debug, warn};

use crate::api::ApiState;
use crate::relay::Outbound;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(mut socket: WebSocket, state: ApiState) {
    let (id, mut rx) = match state.relay.attach().await {
        Ok(attached) => attached,
        Err(err) => {
            warn!("[ws] cannot attach viewer: {}", err);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    debug!("[ws] {} connected", id);

    loop {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("[ws] {} closed connection: {:?}", id, frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("[ws] {} receive error: {}", id, err);
                        break;
                    }
                    None => break,
                }
            }
            outbound = rx.recv() => {
                let message = match outbound {
                    Some(Outbound::Status(status)) => Message::Text(status.to_json()),
                    Some(Outbound::Frame(frame)) => Message::Binary(frame.payload.to_vec()),
                    // Dropped by the relay.
                    None => break,
                };
                if let Err(err) = socket.send(message).await {
                    debug!("[ws] {} send error: {}", id, err);
                    break;
                }
            }
        }
    }

    if let Err(err) = state.relay.detach(id).await {
        debug!("[ws] detach {}: {}", id, err);
    }
    debug!("[ws] {} disconnected", id);
}
