//! WebSocket transport
//!
//! Terminates the browser WebSocket, decodes/encodes the JSON wire protocol,
//! and drives the Room Coordinator. Grounded in `call_server.rs`'s
//! `handle_connection` (accept, split sink/stream, forward outbound
//! messages through an `mpsc` relay task, `tokio::select!`-free receive
//! loop), generalized from the call server's custom `CallMessage` to the
//! tagged `ClientMessage`/`ServerMessage` envelope.

use crate::coordinator::{ParticipantIdentity, RoomCoordinator};
use crate::ids::{RoomId, UserId};
use crate::protocol::{ClientMessage, ControlAction, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

/// Bind and accept connections until the listener errors out.
pub async fn serve(addr: &str, coordinator: Arc<RoomCoordinator>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "relay transport listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, coordinator).await {
                error!(%peer, error = %e, "connection handling failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<RoomCoordinator>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request_path = Arc::new(Mutex::new(String::new()));
    let captured_path = request_path.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, move |req: &tokio_tungstenite::tungstenite::handshake::server::Request, resp| {
        *captured_path.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    })
    .await?;

    let path = request_path.lock().unwrap().clone();
    let Some((user_id, room_id)) = parse_identity(&path) else {
        warn!(%peer, "rejected connection missing user_id/room_id query params");
        return Ok(());
    };

    info!(%peer, %user_id, %room_id, "connection established");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let identity = ParticipantIdentity {
        username: user_id.to_string(),
        full_name: user_id.to_string(),
    };
    coordinator.join(user_id.clone(), room_id.clone(), identity, out_tx.clone()).await;
    out_tx
        .send(ServerMessage::Connected {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            message: "joined".to_string(),
        })
        .await
        .ok();

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_client_message(&coordinator, &user_id, &text, &out_tx).await;
            }
            Ok(Message::Binary(data)) => {
                coordinator.push_audio(&user_id, data.to_vec());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "websocket error");
                break;
            }
        }
    }

    coordinator.leave(&user_id, &room_id, &out_tx).await;
    sender_task.abort();
    info!(%peer, %user_id, "connection closed");
    Ok(())
}

async fn handle_client_message(
    coordinator: &Arc<RoomCoordinator>,
    user_id: &UserId,
    text: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(%user_id, error = %e, "dropping unparseable client message");
            return;
        }
    };

    match parsed {
        ClientMessage::InitSettings {
            input_language,
            output_language,
            speaks_languages,
            understands_languages,
        } => {
            coordinator
                .update_languages(user_id, input_language, output_language, Some(speaks_languages), Some(understands_languages))
                .await;
        }
        ClientMessage::LanguageUpdate {
            input_language,
            output_language,
            speaks_languages,
            understands_languages,
        } => {
            coordinator
                .update_languages(user_id, input_language.clone(), output_language.clone(), speaks_languages, understands_languages)
                .await;
            out_tx
                .send(ServerMessage::LanguageUpdated {
                    input_language,
                    output_language,
                    message: "updated".to_string(),
                })
                .await
                .ok();
        }
        ClientMessage::AudioChunk { audio_data } => match decode_audio_payload(&audio_data) {
            Some(bytes) => coordinator.push_audio(user_id, bytes),
            None => warn!(%user_id, "dropping invalid audio_chunk payload"),
        },
        ClientMessage::Control { action } => match action {
            ControlAction::Mute => {
                coordinator.set_muted(user_id, true).await;
                out_tx.send(ServerMessage::MuteStatus { muted: true }).await.ok();
            }
            ControlAction::Unmute => {
                coordinator.set_muted(user_id, false).await;
                out_tx.send(ServerMessage::MuteStatus { muted: false }).await.ok();
            }
            ControlAction::PauseTranslation => {
                coordinator.set_paused(user_id, true).await;
                out_tx.send(ServerMessage::TranslationStatus { paused: true }).await.ok();
            }
            ControlAction::ResumeTranslation => {
                coordinator.set_paused(user_id, false).await;
                out_tx.send(ServerMessage::TranslationStatus { paused: false }).await.ok();
            }
        },
        ClientMessage::Ping => {
            out_tx.send(ServerMessage::Pong).await.ok();
        }
    }
}

/// `audio_data` is base64 PCM s16le, optionally wrapped in a data URL
/// (`data:audio/raw;base64,...`).
fn decode_audio_payload(data: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let encoded = data.rsplit(',').next().unwrap_or(data);
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

fn parse_identity(request_path: &str) -> Option<(UserId, RoomId)> {
    let query = request_path.split('?').nth(1)?;
    let mut user_id = None;
    let mut room_id = None;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or("");
        match key {
            "user_id" => user_id = Some(UserId::new(value)),
            "room_id" => room_id = Some(RoomId::new(value)),
            _ => {}
        }
    }
    Some((user_id?, room_id?))
}
