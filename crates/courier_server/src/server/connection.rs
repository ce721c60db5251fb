#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use courier_domain::model::DirectoryEntry;
use courier_domain::{UserId, unix_ms_now};
use courier_protocol::{
	CLOSE_BAD_TOKEN, CLOSE_NO_TOKEN, CLOSE_SHUTDOWN, ClientOp, PushBody, ServerFrame, decode_client_op,
};
use futures::{SinkExt as _, StreamExt as _};
use metrics::counter;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::auth::verify_hmac_token;
use super::channels::OpError;
use super::session::SessionRegistry;
use super::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/ws", get(ws_handler))
		.route("/dispatch-message", post(dispatch_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state)
		.layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
	if state.health.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}

async fn ws_handler(
	State(state): State<Arc<AppState>>,
	Query(params): Query<HashMap<String, String>>,
	ws: WebSocketUpgrade,
) -> Response {
	let token = params.get("token").cloned();
	ws.on_upgrade(move |socket| handle_socket(state, socket, token))
}

/// Authenticate after the upgrade so the client sees a close code instead
/// of a failed handshake.
async fn handle_socket(state: Arc<AppState>, socket: WebSocket, token: Option<String>) {
	let Some(token) = token else {
		close_with(socket, CLOSE_NO_TOKEN, "missing token").await;
		return;
	};

	let user = match verify_hmac_token(&token, state.auth_secret.expose()) {
		Ok(user) => user,
		Err(e) => {
			debug!(error = %e, "websocket auth rejected");
			close_with(socket, CLOSE_BAD_TOKEN, "invalid token").await;
			return;
		}
	};

	run_session(state, socket, user).await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
	let _ = socket
		.send(Message::Close(Some(CloseFrame {
			code,
			reason: reason.into(),
		})))
		.await;
}

async fn run_session(state: Arc<AppState>, socket: WebSocket, user: UserId) {
	info!(user = %user, "session opened");
	counter!("courier_ws_connections_total").increment(1);

	let (session_token, mut queue) = state.sessions.register(&user);
	let (mut sink, mut stream) = socket.split();

	publish_presence(&state, &user).await;

	// First frame after connect is always the user's channel index.
	match state.channels.channel_list(&user).await {
		Ok(channels) => {
			// Re-enter the room sets for every known channel; they hold
			// connected subscribers and were cleared when the previous
			// session closed.
			for entry in &channels {
				state.sessions.subscribe(&user, entry.channel_id);
				if let Err(e) = state.directory.add_room_member(&entry.channel_id, &user).await {
					warn!(user = %user, channel = %entry.channel_id, error = %e, "room subscribe failed");
				}
			}
			let frame = ServerFrame::ChannelList { channels };
			if sink.send(Message::Text(frame.to_json())).await.is_err() {
				teardown(&state, &user, session_token).await;
				return;
			}
		}
		Err(e) => {
			error!(user = %user, error = %e, "channel list load failed");
			let frame = ServerFrame::Error {
				error: "internal error".to_string(),
			};
			let _ = sink.send(Message::Text(frame.to_json())).await;
		}
	}

	let mut shutdown = state.shutdown.clone();
	let mut heartbeat = tokio::time::interval(state.heartbeat);
	heartbeat.tick().await;

	loop {
		tokio::select! {
			incoming = stream.next() => {
				match incoming {
					Some(Ok(Message::Text(text))) => {
						for frame in handle_frame(&state, &user, &text).await {
							if sink.send(Message::Text(frame.to_json())).await.is_err() {
								teardown(&state, &user, session_token).await;
								return;
							}
						}
					}
					Some(Ok(Message::Binary(_))) => {
						warn!(user = %user, "binary frame ignored");
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						debug!(user = %user, error = %e, "websocket read error");
						break;
					}
				}
			}
			pushed = queue.recv() => {
				match pushed {
					Some(frame) => {
						if sink.send(Message::Text(frame.to_json())).await.is_err() {
							break;
						}
					}
					// Queue closed: a reconnect replaced this session.
					None => break,
				}
			}
			_ = heartbeat.tick() => {
				publish_presence(&state, &user).await;
			}
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					let _ = sink
						.send(Message::Close(Some(CloseFrame {
							code: CLOSE_SHUTDOWN,
							reason: "server shutting down".into(),
						})))
						.await;
					break;
				}
			}
		}
	}

	teardown(&state, &user, session_token).await;
	info!(user = %user, "session closed");
}

/// Publish (or refresh) this user's routing entry.
async fn publish_presence(state: &AppState, user: &UserId) {
	let entry = DirectoryEntry {
		user_id: user.clone(),
		instance: state.instance,
		host: state.advertise_host.clone(),
		port: state.advertise_port,
		updated_at: unix_ms_now(),
	};
	if let Err(e) = state.directory.publish(&entry).await {
		warn!(user = %user, error = %e, "presence publish failed");
	}
}

pub(crate) async fn teardown(state: &AppState, user: &UserId, token: super::session::SessionToken) {
	let subscribed = state.sessions.subscriptions(user);
	state.sessions.deregister(user, token);
	// A reconnect on this same instance may already own a fresh session;
	// only clear presence when we were the last one out.
	if state.sessions.is_connected(user) {
		return;
	}

	for channel in subscribed {
		if let Err(e) = state.directory.remove_room_member(&channel, user).await {
			warn!(user = %user, channel = %channel, error = %e, "room cleanup failed");
		}
	}
	if let Err(e) = state.directory.remove(user, state.instance).await {
		warn!(user = %user, error = %e, "presence removal failed");
	}
}

/// Decode and execute one client frame, returning the direct replies.
///
/// Chat messages get no direct reply: the sender receives their own copy
/// through the fan-out path like everyone else.
pub(crate) async fn handle_frame(state: &AppState, user: &UserId, text: &str) -> Vec<ServerFrame> {
	let op = match decode_client_op(text) {
		Ok(op) => op,
		Err(e) => {
			debug!(user = %user, error = %e, "undecodable client frame");
			return vec![ServerFrame::Error { error: e.to_string() }];
		}
	};

	let result = match op {
		ClientOp::CreateChannel { name, participants } => {
			match state.channels.create_channel(user, name, &participants).await {
				Ok((channel, participants)) => {
					let created = ServerFrame::ChannelCreated {
						channel: channel.clone(),
						participants,
					};
					// The creator is auto-joined: they get the same
					// channel_joined reply an explicit join would produce
					// (empty history for a brand-new channel).
					state
						.channels
						.join_channel(user, &channel.channel_id)
						.await
						.map(|(channel, participants, messages)| {
							state.sessions.subscribe(user, channel.channel_id);
							vec![
								created,
								ServerFrame::ChannelJoined {
									channel,
									participants,
									messages,
								},
							]
						})
				}
				Err(e) => Err(e),
			}
		}
		ClientOp::JoinChannel { channel_id } => {
			state.channels.join_channel(user, &channel_id).await.map(|(channel, participants, messages)| {
				state.sessions.subscribe(user, channel.channel_id);
				vec![ServerFrame::ChannelJoined {
					channel,
					participants,
					messages,
				}]
			})
		}
		ClientOp::LeaveChannel { channel_id } => state.channels.leave_channel(user, &channel_id).await.map(|()| {
			state.sessions.unsubscribe(user, &channel_id);
			vec![ServerFrame::ChannelLeft { channel_id }]
		}),
		ClientOp::ChatMessage {
			channel_id,
			content,
			metadata,
		} => state
			.channels
			.post_message(user, &channel_id, content, metadata)
			.await
			.map(|_| Vec::new()),
		ClientOp::MarkChannelRead { channel_id } => state
			.channels
			.mark_read(user, &channel_id)
			.await
			.map(|()| vec![ServerFrame::ReadMarked { channel_id }]),
	};

	match result {
		Ok(frames) => frames,
		Err(OpError::Validation(msg)) => vec![ServerFrame::Error { error: msg }],
		Err(OpError::NotFound) => vec![ServerFrame::Error {
			error: "channel not found".to_string(),
		}],
		Err(OpError::Upstream(e)) => {
			error!(user = %user, error = %e, "operation failed");
			vec![ServerFrame::Error {
				error: "internal error".to_string(),
			}]
		}
	}
}

#[derive(Debug, Serialize)]
pub(crate) struct PushOutcome {
	pub delivered: usize,
	pub missed: usize,
}

/// Hand pushed records to their local sessions.
///
/// A missed target is not an error: the user may have disconnected since
/// the dispatcher resolved them, and absence here is the accepted loss.
pub(crate) fn deliver_push(sessions: &SessionRegistry, body: PushBody) -> PushOutcome {
	let mut outcome = PushOutcome {
		delivered: 0,
		missed: 0,
	};
	for record in body.into_messages() {
		let target = record.target_user_id.clone();
		if sessions.deliver(&target, ServerFrame::ChatMessage { message: record }) {
			outcome.delivered += 1;
		} else {
			debug!(user = %target, "pushed message for absent session");
			outcome.missed += 1;
		}
	}
	counter!("courier_push_delivered_total").increment(outcome.delivered as u64);
	counter!("courier_push_missed_total").increment(outcome.missed as u64);
	outcome
}

async fn dispatch_handler(State(state): State<Arc<AppState>>, axum::Json(body): axum::Json<PushBody>) -> Response {
	let outcome = deliver_push(&state.sessions, body);
	(StatusCode::OK, axum::Json(outcome)).into_response()
}
