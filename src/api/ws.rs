//! WebSocket live feed.
//!
//! Bridges the broadcast channel onto a socket, filtered by session id
//! and optionally by a comma-separated topic list. Lagged receivers skip
//! ahead rather than disconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::api::AppState;
use crate::models::LiveEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
    /// Comma-separated topic names; unset means all topics.
    pub topics: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

fn wants(event: &LiveEvent, query: &WsQuery, topics: &Option<HashSet<String>>) -> bool {
    if let Some(session_id) = &query.session_id {
        if event.session_id() != session_id {
            return false;
        }
    }
    match topics {
        Some(set) => set.contains(event.topic()),
        None => true,
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let topics: Option<HashSet<String>> = query.topics.as_ref().map(|raw| {
        raw.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    });

    let mut rx = state.broadcaster.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if !wants(&event, &query, &topics) {
                        continue;
                    }
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "WebSocket subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LiveEvent;

    #[test]
    fn filter_by_session_and_topic() {
        let event = LiveEvent::OrderbookLive {
            session_id: "s1".to_string(),
        };
        let all = WsQuery {
            session_id: None,
            topics: None,
        };
        assert!(wants(&event, &all, &None));

        let other_session = WsQuery {
            session_id: Some("s2".to_string()),
            topics: None,
        };
        assert!(!wants(&event, &other_session, &None));

        let topic_match: Option<HashSet<String>> =
            Some(["orderbook_live".to_string()].into_iter().collect());
        let topic_miss: Option<HashSet<String>> =
            Some(["trades".to_string()].into_iter().collect());
        let same_session = WsQuery {
            session_id: Some("s1".to_string()),
            topics: None,
        };
        assert!(wants(&event, &same_session, &topic_match));
        assert!(!wants(&event, &same_session, &topic_miss));
    }
}
