use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use matchpoint_types::api::Claims;
use matchpoint_types::events::{ChatCommand, ChatEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a client has to send its Identify command after connecting.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: Identify handshake, Ready, then the
/// event loop. Conversation-scoped events are forwarded only for
/// conversations the client subscribed to.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, display_name) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", display_name, user_id);

    let ready = ChatEvent::Ready {
        user_id,
        display_name: display_name.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    // Tell this client who is already online before announcing them.
    for (uid, uname) in dispatcher.online_users().await {
        let event = ChatEvent::PresenceUpdate {
            user_id: uid,
            display_name: uname,
            online: true,
        };
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }

    dispatcher.user_online(user_id, display_name.clone()).await;

    let mut broadcast_rx = dispatcher.subscribe();
    let dispatcher_recv = dispatcher.clone();

    // Conversations this connection wants events for (shared with recv task).
    let subscriptions: Arc<RwLock<HashSet<i64>>> = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts to this client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(conversation_id) = event.conversation_id() {
                        let subs = send_subscriptions
                            .read()
                            .expect("subscription lock poisoned");
                        if !subs.contains(&conversation_id) {
                            continue;
                        }
                    }

                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client
    let display_name_recv = display_name.clone();
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ChatCommand>(&text) {
                    Ok(cmd) => handle_command(
                        &dispatcher_recv,
                        user_id,
                        &display_name_recv,
                        cmd,
                        &recv_subscriptions,
                    ),
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            display_name_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.user_offline(user_id).await;
    info!("{} ({}) disconnected from gateway", display_name, user_id);
}

fn handle_command(
    dispatcher: &Dispatcher,
    user_id: Uuid,
    display_name: &str,
    cmd: ChatCommand,
    subscriptions: &Arc<RwLock<HashSet<i64>>>,
) {
    match cmd {
        ChatCommand::Identify { .. } => {} // already handled during the handshake

        ChatCommand::Subscribe { conversation_ids } => {
            info!(
                "{} ({}) subscribing to {} conversations",
                display_name,
                user_id,
                conversation_ids.len()
            );
            let mut subs = subscriptions.write().expect("subscription lock poisoned");
            *subs = conversation_ids.into_iter().collect();
        }

        ChatCommand::StartTyping { conversation_id } => {
            dispatcher.broadcast(ChatEvent::TypingStart {
                conversation_id,
                user_id,
                display_name: display_name.to_string(),
            });
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ChatEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).expect("event serialization");
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ChatCommand::Identify { token }) =
                    serde_json::from_str::<ChatCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.display_name));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}
