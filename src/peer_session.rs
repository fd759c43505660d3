use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use futures::sink::Sink;
use futures::sink::SinkExt;
use futures::stream::TryStream;
use futures::stream::TryStreamExt;
use rand::Rng;
use serde_json::json;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config_models::peer_config::PeerConfig;
use crate::errors::P2pError;
use crate::models::channel::InboundGrant;
use crate::models::channel::P2pMessage;
use crate::models::channel::P2pRequest;
use crate::models::channel::ResponseHandle;
use crate::models::channel::SessionCommand;
use crate::models::channel::SessionEvent;
use crate::models::node_info::NodeInfo;
use crate::models::peer::sanitize_close_reason;
use crate::models::peer::ABNORMAL_CLOSURE_CODE;
use crate::models::peer::ConnectionState;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;
use crate::models::peer::PeerKind;
use crate::models::peer::PeerMetrics;
use crate::models::peer::Productivity;
use crate::models::peer::TransferConnectionStatus;
use crate::models::peer::WireMessage;
use crate::models::peer::EVENT_NODE_INFO_CHANGED;
use crate::models::peer::FAILED_TO_RESPOND_CODE;
use crate::models::peer::FORBIDDEN_CONNECTION_CODE;
use crate::models::peer::INITIAL_REPUTATION;
use crate::models::peer::INTENTIONAL_DISCONNECT_STATUS_CODE;
use crate::models::peer::PROCEDURE_PEER_LIST;
use crate::models::peer::PROCEDURE_STATUS;
use crate::models::peer::PROCEDURE_UPDATE_MYSELF;
use crate::transport;
use crate::transport::WireStream;
use crate::transport::MAGIC_STRING_REQUEST;
use crate::transport::MAGIC_STRING_RESPONSE;
use crate::validation;

/// How a session intends to shut down.
#[derive(Debug)]
struct CloseIntent {
    code: u16,
    reason: String,
    notify_remote: bool,
}

/// An in-flight RPC we issued, waiting for its response or deadline.
struct PendingRpc {
    procedure: String,
    deadline: Instant,
    target: PendingTarget,
}

/// Who is waiting for the response: an external caller's oneshot, or one of
/// the session's own bookkeeping requests.
enum PendingTarget {
    External(oneshot::Sender<Result<Value, P2pError>>),
    Status,
    PeerList,
    NodeInfoPush,
}

/// Tracks the `status` + `list` probes issued right after an outbound
/// connect. A partial failure is reported once both have resolved.
#[derive(Default)]
struct OnConnectProbe {
    status_pending: bool,
    list_pending: bool,
    failure: Option<String>,
}

/// State machine for one peer connection.
///
/// The session exclusively owns its socket and all per-connection state;
/// everything else talks to it through its command channel and observes it
/// through the session-event channel.
pub(crate) struct PeerSession {
    peer_id: PeerId,
    peer_info: PeerInfo,
    kind: PeerKind,
    state: ConnectionState,
    reputation: i32,
    banned: bool,
    latency_ms: u64,
    ws_message_count: u64,
    ws_message_rate: f64,
    rpc_counters: HashMap<String, u64>,
    rpc_rates: HashMap<String, f64>,
    message_counters: HashMap<String, u64>,
    message_rates: HashMap<String, f64>,
    productivity: Productivity,
    pending: HashMap<u64, PendingRpc>,
    next_rpc_id: u64,
    node_info: NodeInfo,
    config: PeerConfig,
    max_payload: usize,
    events: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    outstanding_ping: Option<(u64, Instant)>,
    on_connect: OnConnectProbe,
    close: Option<CloseIntent>,
}

impl PeerSession {
    pub(crate) fn new(
        peer_info: PeerInfo,
        kind: PeerKind,
        node_info: NodeInfo,
        config: PeerConfig,
        events: mpsc::Sender<SessionEvent>,
        cmd_tx: mpsc::Sender<SessionCommand>,
    ) -> Self {
        let max_payload = match kind {
            PeerKind::Inbound => config.ws_max_payload_inbound,
            PeerKind::Outbound => config.ws_max_payload_outbound,
        };
        PeerSession {
            peer_id: peer_info.peer_id(),
            peer_info,
            kind,
            state: ConnectionState::Connecting,
            reputation: INITIAL_REPUTATION,
            banned: false,
            latency_ms: 0,
            ws_message_count: 0,
            ws_message_rate: 0.0,
            rpc_counters: HashMap::new(),
            rpc_rates: HashMap::new(),
            message_counters: HashMap::new(),
            message_rates: HashMap::new(),
            productivity: Productivity::new(),
            pending: HashMap::new(),
            next_rpc_id: 0,
            node_info,
            config,
            max_payload,
            events,
            cmd_tx,
            outstanding_ping: None,
            on_connect: OnConnectProbe::default(),
            close: None,
        }
    }

    /// Drive the session until it closes. Always emits a final `Closed`
    /// event, whatever made the loop stop.
    pub(crate) async fn run<S>(
        mut self,
        mut stream: S,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> Result<()>
    where
        S: Sink<WireMessage> + TryStream<Ok = WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
        <S as TryStream>::Error: std::error::Error,
    {
        self.state = ConnectionState::Open;
        self.emit(SessionEvent::Opened {
            peer_id: self.peer_id.clone(),
            kind: self.kind,
            peer_info: self.peer_info.clone(),
        })
        .await;

        let result = self.drive(&mut stream, &mut commands).await;
        if let Err(ref e) = result {
            self.emit(SessionEvent::SocketError {
                peer_id: self.peer_id.clone(),
                kind: self.kind,
                error: format!("{e:#}"),
            })
            .await;
            if self.close.is_none() {
                self.close = Some(CloseIntent {
                    code: ABNORMAL_CLOSURE_CODE,
                    reason: format!("{e:#}"),
                    notify_remote: false,
                });
            }
        }
        self.finish(&mut stream).await;
        result
    }

    async fn drive<S>(
        &mut self,
        stream: &mut S,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<()>
    where
        S: Sink<WireMessage> + TryStream<Ok = WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
        <S as TryStream>::Error: std::error::Error,
    {
        if let PeerKind::Outbound = self.kind {
            self.collect_peer_details(stream).await?;
        }

        let rate_interval = self.config.rate_calculation_interval;
        let mut rate_timer = time::interval_at(time::Instant::now() + rate_interval, rate_interval);
        rate_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let productivity_interval = self.config.productivity_reset_interval;
        let mut productivity_timer =
            time::interval_at(time::Instant::now() + productivity_interval, productivity_interval);
        productivity_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let ping_timer = time::sleep(self.next_ping_delay());
        tokio::pin!(ping_timer);

        while self.close.is_none() {
            let ack_deadline = self.pending.values().map(|p| p.deadline).min();

            select! {
                frame = stream.try_next() => match frame {
                    Ok(Some(message)) => self.on_wire_message(message, stream).await?,
                    Ok(None) => {
                        info!("Peer {} closed the connection", self.peer_id);
                        self.close = Some(CloseIntent {
                            code: INTENTIONAL_DISCONNECT_STATUS_CODE,
                            reason: "Peer closed the connection".to_string(),
                            notify_remote: false,
                        });
                    }
                    Err(e) => {
                        bail!("error receiving from peer {}: {e}", self.peer_id);
                    }
                },

                command = commands.recv() => match command {
                    Some(command) => self.on_command(command, stream).await?,
                    None => {
                        // The pool dropped its handle; shut down cleanly.
                        self.close = Some(CloseIntent {
                            code: INTENTIONAL_DISCONNECT_STATUS_CODE,
                            reason: "Intentionally disconnected".to_string(),
                            notify_remote: true,
                        });
                    }
                },

                _ = rate_timer.tick() => self.on_rate_tick().await,

                _ = productivity_timer.tick() => self.on_productivity_tick(),

                _ = &mut ping_timer, if matches!(self.kind, PeerKind::Inbound) => {
                    self.send_keep_alive(stream).await?;
                    ping_timer.as_mut().reset(time::Instant::now() + self.next_ping_delay());
                },

                _ = maybe_sleep_until(ack_deadline) => self.on_ack_timeout().await,
            }
        }

        Ok(())
    }

    /// Flush the close handshake, fail whatever is still pending, and emit
    /// the terminal `Closed` event. `Closed` is terminal: a second call is
    /// a no-op.
    async fn finish<S>(&mut self, stream: &mut S)
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        if self.state == ConnectionState::Closed {
            return;
        }
        let intent = self.close.take().unwrap_or(CloseIntent {
            code: ABNORMAL_CLOSURE_CODE,
            reason: "Connection lost".to_string(),
            notify_remote: false,
        });
        if intent.notify_remote {
            let bye = WireMessage::Bye {
                code: intent.code,
                reason: intent.reason.clone(),
            };
            if let Err(e) = stream.send(bye).await {
                trace!("Could not notify {} of disconnect: {e}", self.peer_id);
            }
        }
        self.state = ConnectionState::Closed;

        for (_, pending) in self.pending.drain() {
            if let PendingTarget::External(tx) = pending.target {
                let _ = tx.send(Err(P2pError::RpcResponseError {
                    procedure: pending.procedure,
                    message: "socket does not exist".to_string(),
                }));
            }
        }

        self.emit(SessionEvent::Closed {
            peer_id: self.peer_id.clone(),
            kind: self.kind,
            code: intent.code,
            reason: intent.reason,
        })
        .await;
    }

    async fn on_wire_message<S>(&mut self, message: WireMessage, stream: &mut S) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        self.ws_message_count += 1;

        match message {
            WireMessage::RpcRequest { id, procedure, data } => {
                self.on_rpc_request(id, procedure, data, stream).await?;
            }
            WireMessage::RpcResponse { id, result } => {
                self.on_rpc_response(id, result).await;
            }
            WireMessage::Message { event, data } => {
                self.on_remote_message(event, data).await;
            }
            WireMessage::Ping { nonce } => {
                self.send_frame(stream, WireMessage::Pong { nonce }).await?;
            }
            WireMessage::Pong { nonce } => self.on_pong(nonce),
            WireMessage::Bye { code, reason } => {
                let reason = sanitize_close_reason(code, &reason);
                info!("Peer {} disconnected us: {code} {reason}", self.peer_id);
                self.close = Some(CloseIntent {
                    code,
                    reason,
                    notify_remote: false,
                });
            }
            other => {
                warn!(
                    "Unexpected {} frame from {} after handshake",
                    other.get_type(),
                    self.peer_id
                );
            }
        }
        Ok(())
    }

    async fn on_rpc_request<S>(
        &mut self,
        id: u64,
        procedure: String,
        data: Vec<u8>,
        stream: &mut S,
    ) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let raw_data = match serde_json::from_slice::<Value>(&data) {
            Ok(value) => value,
            Err(e) => {
                let error = format!("malformed RPC payload: {e}");
                self.send_frame(stream, WireMessage::RpcResponse { id, result: Err(error.clone()) })
                    .await?;
                self.emit(SessionEvent::InvalidRequestReceived {
                    peer_id: self.peer_id.clone(),
                    error,
                })
                .await;
                return Ok(());
            }
        };
        let envelope = match validation::validate_rpc_request(
            &json!({ "procedure": procedure, "data": raw_data }),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = e.to_string();
                self.send_frame(stream, WireMessage::RpcResponse { id, result: Err(error.clone()) })
                    .await?;
                self.emit(SessionEvent::InvalidRequestReceived {
                    peer_id: self.peer_id.clone(),
                    error,
                })
                .await;
                return Ok(());
            }
        };

        *self
            .rpc_counters
            .entry(envelope.procedure.clone())
            .or_insert(0) += 1;
        let rate = self
            .rpc_rates
            .get(&envelope.procedure)
            .copied()
            .unwrap_or(0.0)
            * 1000.0;

        let responder = ResponseHandle::new(id, self.cmd_tx.clone());
        let request = P2pRequest {
            procedure: envelope.procedure.clone(),
            data: envelope.data.clone(),
            peer_id: self.peer_id.clone(),
            rate,
            productivity: self.productivity,
            responder: responder.clone(),
        };

        match envelope.procedure.as_str() {
            PROCEDURE_UPDATE_MYSELF => {
                self.on_update_myself(id, &envelope.data, &responder, stream)
                    .await?;
            }
            PROCEDURE_STATUS => {
                if responder.claim() {
                    let body = serde_json::to_vec(&self.node_info)?;
                    self.send_frame(stream, WireMessage::RpcResponse { id, result: Ok(body) })
                        .await?;
                }
            }
            _ => {}
        }

        // Every request also goes upward, answered or not. The one-shot
        // guard rejects any second response attempt.
        self.emit(SessionEvent::RequestReceived(request)).await;
        Ok(())
    }

    async fn on_update_myself<S>(
        &mut self,
        id: u64,
        data: &Value,
        responder: &ResponseHandle,
        stream: &mut S,
    ) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match self.validate_peer_info_update(data) {
            Ok(incoming) => {
                self.peer_info.update_from(incoming);
                if responder.claim() {
                    let body = serde_json::to_vec(&json!(true))?;
                    self.send_frame(stream, WireMessage::RpcResponse { id, result: Ok(body) })
                        .await?;
                }
                self.emit(SessionEvent::UpdatedPeerInfo {
                    peer_id: self.peer_id.clone(),
                    peer_info: self.peer_info.clone(),
                })
                .await;
            }
            Err(e) => {
                let error = e.to_string();
                if responder.claim() {
                    self.send_frame(
                        stream,
                        WireMessage::RpcResponse { id, result: Err(error.clone()) },
                    )
                    .await?;
                }
                self.emit(SessionEvent::FailedPeerInfoUpdate {
                    peer_id: self.peer_id.clone(),
                    error,
                })
                .await;
            }
        }
        Ok(())
    }

    /// Validate a peer-info update sent by the remote. The remote does not
    /// get to pick its own address: identity fields are pinned to what the
    /// connection already established.
    fn validate_peer_info_update(&self, data: &Value) -> Result<PeerInfo, P2pError> {
        let mut raw = data.clone();
        let object = raw
            .as_object_mut()
            .ok_or_else(|| P2pError::InvalidPeer("peer info must be an object".to_string()))?;
        object.insert("ip".to_string(), json!(self.peer_info.ip_address));
        object.insert("wsPort".to_string(), json!(self.peer_info.ws_port));
        validation::validate_peer_info(&raw, self.config.max_peer_info_size)
    }

    async fn on_rpc_response(&mut self, id: u64, result: Result<Vec<u8>, String>) {
        let Some(pending) = self.pending.remove(&id) else {
            warn!("Unsolicited RPC response {id} from {}", self.peer_id);
            return;
        };
        let procedure = pending.procedure;

        let outcome: Result<Value, P2pError> = match result {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Null) => Err(P2pError::RpcResponseError {
                    procedure: procedure.clone(),
                    message: format!("Failed to handle response for procedure {procedure}"),
                }),
                Ok(value) => Ok(value),
                Err(e) => Err(P2pError::InvalidRpcResponse(format!(
                    "malformed response for procedure {procedure}: {e}"
                ))),
            },
            Err(message) => Err(P2pError::RpcResponseError {
                procedure: procedure.clone(),
                message,
            }),
        };

        if outcome.is_ok() {
            self.productivity.note_response();
        }

        match pending.target {
            PendingTarget::External(tx) => {
                let _ = tx.send(outcome);
            }
            PendingTarget::Status => {
                let failure = match outcome {
                    Ok(value) => match self.validate_peer_info_update(&value) {
                        Ok(incoming) => {
                            self.peer_info.update_from(incoming);
                            self.emit(SessionEvent::UpdatedPeerInfo {
                                peer_id: self.peer_id.clone(),
                                peer_info: self.peer_info.clone(),
                            })
                            .await;
                            None
                        }
                        Err(e) => Some(e.to_string()),
                    },
                    Err(e) => Some(e.to_string()),
                };
                if let Some(error) = failure.clone() {
                    self.emit(SessionEvent::FailedToFetchPeerInfo {
                        peer_id: self.peer_id.clone(),
                        error,
                    })
                    .await;
                }
                self.resolve_status_probe(failure).await;
            }
            PendingTarget::PeerList => {
                let failure = match outcome {
                    Ok(value) => match validation::validate_peer_list(
                        &value,
                        self.config.max_peer_list_length,
                        self.config.max_peer_info_size,
                    ) {
                        Ok(peers) => {
                            self.emit(SessionEvent::DiscoveredPeers {
                                peer_id: self.peer_id.clone(),
                                peers,
                            })
                            .await;
                            None
                        }
                        Err(e) => Some(e.to_string()),
                    },
                    Err(e) => Some(e.to_string()),
                };
                if let Some(error) = failure.clone() {
                    self.emit(SessionEvent::FailedToFetchPeers {
                        peer_id: self.peer_id.clone(),
                        error,
                    })
                    .await;
                }
                self.resolve_list_probe(failure).await;
            }
            PendingTarget::NodeInfoPush => {
                if let Err(e) = outcome {
                    self.emit(SessionEvent::FailedToPushNodeInfo {
                        peer_id: self.peer_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    async fn on_remote_message(&mut self, event: String, data: Vec<u8>) {
        let raw_data = match serde_json::from_slice::<Value>(&data) {
            Ok(value) => value,
            Err(e) => {
                self.emit(SessionEvent::InvalidMessageReceived {
                    peer_id: self.peer_id.clone(),
                    error: format!("malformed message payload: {e}"),
                })
                .await;
                return;
            }
        };
        let envelope =
            match validation::validate_message(&json!({ "event": event, "data": raw_data })) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.emit(SessionEvent::InvalidMessageReceived {
                        peer_id: self.peer_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                    return;
                }
            };

        *self
            .message_counters
            .entry(envelope.event.clone())
            .or_insert(0) += 1;
        let rate = self
            .message_rates
            .get(&envelope.event)
            .copied()
            .unwrap_or(0.0)
            * 1000.0;

        if envelope.event == EVENT_NODE_INFO_CHANGED {
            match self.validate_peer_info_update(&envelope.data) {
                Ok(incoming) => {
                    self.peer_info.update_from(incoming);
                    self.emit(SessionEvent::UpdatedPeerInfo {
                        peer_id: self.peer_id.clone(),
                        peer_info: self.peer_info.clone(),
                    })
                    .await;
                }
                Err(e) => {
                    self.emit(SessionEvent::FailedPeerInfoUpdate {
                        peer_id: self.peer_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }

        self.emit(SessionEvent::MessageReceived(P2pMessage {
            event: envelope.event,
            data: envelope.data,
            peer_id: self.peer_id.clone(),
            rate,
        }))
        .await;
    }

    async fn on_command<S>(&mut self, command: SessionCommand, stream: &mut S) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match command {
            SessionCommand::Send { event, data } => {
                self.send_message(stream, event, data).await?;
            }
            SessionCommand::Request {
                procedure,
                data,
                response,
            } => {
                self.send_request(stream, procedure, data, PendingTarget::External(response))
                    .await?;
            }
            SessionCommand::Respond { id, result } => {
                let wire_result = match result {
                    Ok(value) => Ok(serde_json::to_vec(&value)?),
                    Err(message) => Err(message),
                };
                self.send_frame(stream, WireMessage::RpcResponse { id, result: wire_result })
                    .await?;
            }
            SessionCommand::ApplyNodeInfo(node_info) => {
                self.apply_node_info(stream, node_info).await?;
            }
            SessionCommand::ApplyPenalty(penalty) => {
                self.apply_penalty(penalty).await;
            }
            SessionCommand::Disconnect { code, reason } => {
                self.close = Some(CloseIntent {
                    code,
                    reason,
                    notify_remote: true,
                });
            }
        }
        Ok(())
    }

    async fn send_message<S>(&mut self, stream: &mut S, event: String, data: Value) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let bytes = serde_json::to_vec(&data)?;
        if bytes.len() > self.max_payload {
            self.emit(SessionEvent::FailedToSendMessage {
                peer_id: self.peer_id.clone(),
                error: format!(
                    "outgoing payload of {} bytes exceeds the limit of {}",
                    bytes.len(),
                    self.max_payload
                ),
            })
            .await;
            return Ok(());
        }
        self.send_frame(stream, WireMessage::Message { event, data: bytes })
            .await
    }

    async fn send_request<S>(
        &mut self,
        stream: &mut S,
        procedure: String,
        data: Value,
        target: PendingTarget,
    ) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let id = self.next_rpc_id;
        self.next_rpc_id += 1;
        self.productivity.note_request();

        let bytes = serde_json::to_vec(&data)?;
        self.pending.insert(
            id,
            PendingRpc {
                procedure: procedure.clone(),
                deadline: Instant::now() + self.config.ack_timeout,
                target,
            },
        );

        let frame = WireMessage::RpcRequest {
            id,
            procedure: procedure.clone(),
            data: bytes,
        };
        if let Err(e) = stream.send(frame).await {
            if let Some(pending) = self.pending.remove(&id) {
                if let PendingTarget::External(tx) = pending.target {
                    let _ = tx.send(Err(P2pError::RpcResponseError {
                        procedure: procedure.clone(),
                        message: format!("failed to send request: {e}"),
                    }));
                }
            }
            bail!("failed to send request frame to {}: {e}", self.peer_id);
        }
        Ok(())
    }

    async fn apply_node_info<S>(&mut self, stream: &mut S, node_info: NodeInfo) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let data = serde_json::to_value(&node_info)?;
        self.node_info = node_info;
        match self.kind {
            // Passive peers cannot be invoked; push a message instead.
            PeerKind::Inbound => {
                self.send_message(stream, EVENT_NODE_INFO_CHANGED.to_string(), data)
                    .await
            }
            PeerKind::Outbound => {
                self.send_request(
                    stream,
                    PROCEDURE_UPDATE_MYSELF.to_string(),
                    data,
                    PendingTarget::NodeInfoPush,
                )
                .await
            }
        }
    }

    /// Subtract from the peer's reputation. At zero the ban fires exactly
    /// once: `BanPeer` goes out and the connection is closed as forbidden.
    async fn apply_penalty(&mut self, penalty: u32) {
        self.reputation -= penalty as i32;
        debug!(
            "Applied penalty {penalty} to {}; reputation is now {}",
            self.peer_id, self.reputation
        );
        if self.reputation <= 0 && !self.banned {
            self.banned = true;
            info!("Banning peer {}", self.peer_id);
            self.emit(SessionEvent::BanPeer {
                peer_id: self.peer_id.clone(),
            })
            .await;
            self.close = Some(CloseIntent {
                code: FORBIDDEN_CONNECTION_CODE,
                reason: "Forbidden connection".to_string(),
                notify_remote: true,
            });
        }
    }

    /// Rotate counters into rates. An over-limit socket message rate is
    /// penalized immediately and suppresses this tick's rotation.
    async fn on_rate_tick(&mut self) {
        let interval_ms = (self.config.rate_calculation_interval.as_millis() as f64).max(1.0);
        self.ws_message_rate = self.ws_message_count as f64 * 1000.0 / interval_ms;
        self.ws_message_count = 0;

        if self.ws_message_rate > self.config.ws_max_message_rate {
            warn!(
                "Peer {} exceeded the message rate limit: {:.1}/s > {:.1}/s",
                self.peer_id, self.ws_message_rate, self.config.ws_max_message_rate
            );
            self.apply_penalty(self.config.ws_max_message_rate_penalty)
                .await;
        } else {
            for (procedure, count) in self.rpc_counters.drain() {
                self.rpc_rates.insert(procedure, count as f64 / interval_ms);
            }
            for (event, count) in self.message_counters.drain() {
                self.message_rates.insert(event, count as f64 / interval_ms);
            }
        }

        self.emit(SessionEvent::MetricsTick {
            peer_id: self.peer_id.clone(),
            metrics: PeerMetrics {
                latency_ms: self.latency_ms,
                response_rate: self.productivity.response_rate,
                ws_message_rate: self.ws_message_rate,
            },
        })
        .await;
    }

    fn on_productivity_tick(&mut self) {
        if self
            .productivity
            .is_stale(self.config.productivity_reset_interval)
        {
            debug!("Resetting productivity of unresponsive peer {}", self.peer_id);
            self.productivity.reset();
        }
    }

    async fn send_keep_alive<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let nonce = rand::random();
        self.outstanding_ping = Some((nonce, Instant::now()));
        self.send_frame(stream, WireMessage::Ping { nonce }).await
    }

    fn next_ping_delay(&self) -> Duration {
        let min = self.config.ping_interval_min;
        let max = self.config.ping_interval_max;
        if max <= min {
            return min;
        }
        let spread = (max - min).as_millis() as u64;
        min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    fn on_pong(&mut self, nonce: u64) {
        match self.outstanding_ping.take() {
            Some((expected, sent_at)) if expected == nonce => {
                self.latency_ms = sent_at.elapsed().as_millis() as u64;
            }
            other => self.outstanding_ping = other,
        }
    }

    /// Fail every pending RPC whose deadline passed. A non-responsive remote
    /// is disconnected.
    async fn on_ack_timeout(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }

        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            warn!(
                "RPC '{}' to {} timed out after {:?}",
                pending.procedure, self.peer_id, self.config.ack_timeout
            );
            let timeout_error = || P2pError::RpcTimeout {
                procedure: pending.procedure.clone(),
            };
            match pending.target {
                PendingTarget::External(tx) => {
                    let _ = tx.send(Err(timeout_error()));
                }
                PendingTarget::Status => {
                    self.emit(SessionEvent::FailedToFetchPeerInfo {
                        peer_id: self.peer_id.clone(),
                        error: timeout_error().to_string(),
                    })
                    .await;
                    self.resolve_status_probe(Some(timeout_error().to_string()))
                        .await;
                }
                PendingTarget::PeerList => {
                    self.emit(SessionEvent::FailedToFetchPeers {
                        peer_id: self.peer_id.clone(),
                        error: timeout_error().to_string(),
                    })
                    .await;
                    self.resolve_list_probe(Some(timeout_error().to_string()))
                        .await;
                }
                PendingTarget::NodeInfoPush => {
                    self.emit(SessionEvent::FailedToPushNodeInfo {
                        peer_id: self.peer_id.clone(),
                        error: timeout_error().to_string(),
                    })
                    .await;
                }
            }
        }

        self.close = Some(CloseIntent {
            code: FAILED_TO_RESPOND_CODE,
            reason: "Failed to respond to an RPC request".to_string(),
            notify_remote: true,
        });
    }

    /// Ask a freshly connected outbound peer for its status and peer list.
    async fn collect_peer_details<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        self.on_connect.status_pending = true;
        self.on_connect.list_pending = true;
        self.send_request(
            stream,
            PROCEDURE_STATUS.to_string(),
            Value::Null,
            PendingTarget::Status,
        )
        .await?;
        self.send_request(
            stream,
            PROCEDURE_PEER_LIST.to_string(),
            Value::Null,
            PendingTarget::PeerList,
        )
        .await?;
        Ok(())
    }

    async fn resolve_status_probe(&mut self, failure: Option<String>) {
        if !self.on_connect.status_pending {
            return;
        }
        self.on_connect.status_pending = false;
        if self.on_connect.failure.is_none() {
            self.on_connect.failure = failure;
        }
        self.maybe_report_probe_outcome().await;
    }

    async fn resolve_list_probe(&mut self, failure: Option<String>) {
        if !self.on_connect.list_pending {
            return;
        }
        self.on_connect.list_pending = false;
        if self.on_connect.failure.is_none() {
            self.on_connect.failure = failure;
        }
        self.maybe_report_probe_outcome().await;
    }

    async fn maybe_report_probe_outcome(&mut self) {
        if self.on_connect.status_pending || self.on_connect.list_pending {
            return;
        }
        if let Some(error) = self.on_connect.failure.take() {
            self.emit(SessionEvent::FailedToCollectPeerDetails {
                peer_id: self.peer_id.clone(),
                error,
            })
            .await;
        }
    }

    async fn send_frame<S>(&mut self, stream: &mut S, message: WireMessage) -> Result<()>
    where
        S: Sink<WireMessage> + Unpin,
        <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        if let Err(e) = stream.send(message).await {
            bail!("failed to send frame to {}: {e}", self.peer_id);
        }
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Session event channel for {} is closed", self.peer_id);
        }
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Dial a peer, run the handshake, and drive the session to completion.
/// Establishment failures surface as `ConnectAborted`; the session itself
/// reports everything later through its own events.
pub(crate) async fn run_outbound_session(
    mut peer_info: PeerInfo,
    node_info: NodeInfo,
    config: PeerConfig,
    events: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
) {
    let peer_id = peer_info.peer_id();
    match establish_outbound(&peer_info, &node_info, &config).await {
        Ok((stream, remote_info)) => {
            let ip_address = peer_info.ip_address.clone();
            peer_info.update_from(remote_info.to_peer_info(&ip_address));
            let session = PeerSession::new(
                peer_info,
                PeerKind::Outbound,
                node_info,
                config,
                events,
                cmd_tx,
            );
            if let Err(e) = session.run(stream, cmd_rx).await {
                debug!("Outbound session with {peer_id} ended abnormally: {e:#}");
            }
        }
        Err(e) => {
            warn!("Could not establish outbound connection with {peer_id}: {e}");
            let _ = events
                .send(SessionEvent::ConnectAborted {
                    peer_id,
                    error: e.to_string(),
                })
                .await;
        }
    }
}

/// Run a pre-accepted inbound connection whose handshake already completed.
pub(crate) async fn run_inbound_session<S>(peer_info: PeerInfo, grant: InboundGrant, stream: S)
where
    S: Sink<WireMessage> + TryStream<Ok = WireMessage> + Unpin,
    <S as Sink<WireMessage>>::Error: std::error::Error + Send + Sync + 'static,
    <S as TryStream>::Error: std::error::Error,
{
    let peer_id = peer_info.peer_id();
    let session = PeerSession::new(
        peer_info,
        PeerKind::Inbound,
        grant.node_info,
        grant.peer_config,
        grant.events,
        grant.cmd_tx,
    );
    if let Err(e) = session.run(stream, grant.cmd_rx).await {
        debug!("Inbound session with {peer_id} ended abnormally: {e:#}");
    }
}

/// Dial and complete the handshake: magic plus our node info out, the
/// remote's node info and a connection status back.
async fn establish_outbound(
    peer_info: &PeerInfo,
    node_info: &NodeInfo,
    config: &PeerConfig,
) -> Result<(WireStream<TcpStream>, NodeInfo), P2pError> {
    let ip: IpAddr = peer_info.ip_address.parse().map_err(|_| {
        P2pError::PeerOutboundConnection(format!("invalid peer address: {}", peer_info.ip_address))
    })?;
    let address = SocketAddr::new(ip, peer_info.ws_port);

    let tcp = transport::dial(address, config.connect_timeout).await?;
    let mut stream = transport::wrap_stream(tcp, config.ws_max_payload_outbound);

    let node_info_bytes = serde_json::to_vec(node_info)
        .map_err(|e| P2pError::PeerOutboundConnection(format!("unserializable node info: {e}")))?;
    stream
        .send(WireMessage::Handshake {
            magic: MAGIC_STRING_REQUEST.to_vec(),
            node_info: node_info_bytes,
        })
        .await
        .map_err(|e| P2pError::PeerOutboundConnection(format!("handshake send failed: {e}")))?;

    let handshake = async {
        let first = stream
            .try_next()
            .await
            .map_err(|e| P2pError::PeerOutboundConnection(format!("handshake failed: {e}")))?;
        let remote_info = match first {
            Some(WireMessage::Handshake { magic, node_info }) => {
                if magic != MAGIC_STRING_RESPONSE {
                    return Err(P2pError::PeerOutboundConnection(
                        "unexpected magic value in handshake response".to_string(),
                    ));
                }
                validation::validate_node_info(&node_info, config.max_peer_info_size)
                    .map_err(|e| P2pError::PeerOutboundConnection(e.to_string()))?
            }
            other => {
                return Err(P2pError::PeerOutboundConnection(format!(
                    "expected a handshake response, got {:?}",
                    other.map(|m| m.get_type())
                )));
            }
        };

        if remote_info.network_id != node_info.network_id {
            return Err(P2pError::PeerOutboundConnection(format!(
                "peer runs network {}, this node runs {}",
                remote_info.network_id, node_info.network_id
            )));
        }
        if remote_info.nonce == node_info.nonce {
            return Err(P2pError::PeerOutboundConnection(
                "attempted connection to self".to_string(),
            ));
        }

        let second = stream
            .try_next()
            .await
            .map_err(|e| P2pError::PeerOutboundConnection(format!("handshake failed: {e}")))?;
        match second {
            Some(WireMessage::ConnectionStatus(TransferConnectionStatus::Accepted)) => {
                Ok(remote_info)
            }
            Some(WireMessage::ConnectionStatus(TransferConnectionStatus::Refused(reason))) => {
                Err(P2pError::PeerOutboundConnection(format!(
                    "connection refused: {reason}"
                )))
            }
            other => Err(P2pError::PeerOutboundConnection(format!(
                "expected a connection status, got {:?}",
                other.map(|m| m.get_type())
            ))),
        }
    };

    match time::timeout(config.connect_timeout, handshake).await {
        Ok(Ok(remote_info)) => Ok((stream, remote_info)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(P2pError::PeerOutboundConnection(format!(
            "handshake with {address} timed out"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use bytes::Bytes;
    use bytes::BytesMut;
    use serde_json::Map;
    use tokio_serde::formats::SymmetricalBincode;
    use tokio_serde::Serializer;
    use tokio_util::codec::Encoder;
    use tokio_util::codec::LengthDelimitedCodec;
    use tracing_test::traced_test;

    use super::*;
    use crate::models::peer::EVICTED_PEER_CODE;
    use crate::transport::wrap_stream;

    fn to_bytes(message: &WireMessage) -> Bytes {
        let mut transport = LengthDelimitedCodec::new();
        let mut format = SymmetricalBincode::<WireMessage>::default();
        let mut buf = BytesMut::new();
        let serialized = Pin::new(&mut format).serialize(message).unwrap();
        transport.encode(serialized, &mut buf).unwrap();
        buf.freeze()
    }

    fn dummy_peer_info() -> PeerInfo {
        PeerInfo {
            ip_address: "127.0.0.1".to_string(),
            ws_port: 5000,
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            os: None,
            height: 0,
            options: Map::new(),
        }
    }

    fn dummy_node_info() -> NodeInfo {
        NodeInfo {
            network_id: "test-net".to_string(),
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            min_version: "1.0.0".to_string(),
            os: None,
            ws_port: 6000,
            height: 0,
            modules: vec![],
            nonce: 11,
            options: Map::new(),
        }
    }

    fn test_config() -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
            rate_calculation_interval: Duration::from_millis(10_000),
            ws_max_message_rate: 100.0,
            ws_max_message_rate_penalty: 100,
            ws_max_payload_inbound: 1 << 20,
            ws_max_payload_outbound: 1 << 20,
            max_peer_info_size: 20_480,
            max_peer_list_length: 100,
            productivity_reset_interval: Duration::from_secs(20),
            ping_interval_min: Duration::from_secs(20),
            ping_interval_max: Duration::from_secs(60),
        }
    }

    struct TestSession {
        cmd_tx: mpsc::Sender<SessionCommand>,
        events: mpsc::Receiver<SessionEvent>,
        remote: WireStream<tokio::io::DuplexStream>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    /// Spin up a session over an in-memory duplex pipe; the test drives the
    /// remote end of the pipe directly.
    fn spawn_session(kind: PeerKind, config: PeerConfig) -> TestSession {
        let (local_io, remote_io) = tokio::io::duplex(1 << 20);
        let local = wrap_stream(local_io, config.ws_max_payload_inbound);
        let remote = wrap_stream(remote_io, 1 << 20);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(64);
        let session = PeerSession::new(
            dummy_peer_info(),
            kind,
            dummy_node_info(),
            config,
            event_tx,
            cmd_tx.clone(),
        );
        let handle = tokio::spawn(session.run(local, cmd_rx));
        TestSession {
            cmd_tx,
            events,
            remote,
            handle,
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn status_requests_are_answered_with_node_info() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());

        assert!(matches!(
            next_event(&mut harness.events).await,
            SessionEvent::Opened { .. }
        ));

        harness
            .remote
            .send(WireMessage::RpcRequest {
                id: 42,
                procedure: "status".to_string(),
                data: b"null".to_vec(),
            })
            .await
            .unwrap();

        let response = harness.remote.try_next().await.unwrap().unwrap();
        match response {
            WireMessage::RpcResponse { id, result } => {
                assert_eq!(id, 42);
                let value: Value = serde_json::from_slice(&result.unwrap()).unwrap();
                assert_eq!(value["networkId"], "test-net");
            }
            other => panic!("expected an rpc response, got {other:?}"),
        }

        // The request is still surfaced upward, already answered.
        match next_event(&mut harness.events).await {
            SessionEvent::RequestReceived(request) => {
                assert_eq!(request.procedure(), "status");
                assert!(request.was_response_sent());
                assert!(matches!(
                    request.end(Value::from(1)).await,
                    Err(P2pError::ResponseAlreadySent)
                ));
            }
            other => panic!("expected requestReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_requests_are_answered_through_the_responder() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::RpcRequest {
                id: 9,
                procedure: "getBlocks".to_string(),
                data: b"{\"from\":3}".to_vec(),
            })
            .await
            .unwrap();

        match next_event(&mut harness.events).await {
            SessionEvent::RequestReceived(request) => {
                assert_eq!(request.procedure(), "getBlocks");
                assert_eq!(request.data()["from"], 3);
                assert!(!request.was_response_sent());
                request.end(json!({"blocks": []})).await.unwrap();
            }
            other => panic!("expected requestReceived, got {other:?}"),
        }

        let response = harness.remote.try_next().await.unwrap().unwrap();
        match response {
            WireMessage::RpcResponse { id, result } => {
                assert_eq!(id, 9);
                let value: Value = serde_json::from_slice(&result.unwrap()).unwrap();
                assert_eq!(value, json!({"blocks": []}));
            }
            other => panic!("expected an rpc response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_request_payload_is_dropped_with_an_error_reply() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::RpcRequest {
                id: 1,
                procedure: "status".to_string(),
                data: b"{not json".to_vec(),
            })
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut harness.events).await,
            SessionEvent::InvalidRequestReceived { .. }
        ));
        let reply = harness.remote.try_next().await.unwrap().unwrap();
        assert!(matches!(
            reply,
            WireMessage::RpcResponse { id: 1, result: Err(_) }
        ));
    }

    #[tokio::test]
    async fn messages_are_counted_and_surfaced() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::Message {
                event: "bar".to_string(),
                data: b"\"payload\"".to_vec(),
            })
            .await
            .unwrap();

        match next_event(&mut harness.events).await {
            SessionEvent::MessageReceived(message) => {
                assert_eq!(message.event, "bar");
                assert_eq!(message.data, json!("payload"));
                assert_eq!(message.peer_id.as_str(), "127.0.0.1:5000");
            }
            other => panic!("expected messageReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_message_payload_is_dropped() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::Message {
                event: "bar".to_string(),
                data: b"{broken".to_vec(),
            })
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut harness.events).await,
            SessionEvent::InvalidMessageReceived { .. }
        ));
    }

    #[tokio::test]
    async fn update_myself_cannot_steal_another_identity() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        let hostile = json!({
            "ip": "203.0.113.66",
            "wsPort": 4444,
            "version": "1.3.0",
            "height": 77
        });
        harness
            .remote
            .send(WireMessage::RpcRequest {
                id: 5,
                procedure: "updateMyself".to_string(),
                data: serde_json::to_vec(&hostile).unwrap(),
            })
            .await
            .unwrap();

        match next_event(&mut harness.events).await {
            SessionEvent::UpdatedPeerInfo { peer_id, peer_info } => {
                assert_eq!(peer_id.as_str(), "127.0.0.1:5000");
                assert_eq!(peer_info.ip_address, "127.0.0.1");
                assert_eq!(peer_info.ws_port, 5000);
                assert_eq!(peer_info.version, "1.3.0");
                assert_eq!(peer_info.height, 77);
            }
            other => panic!("expected updatedPeerInfo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outgoing_requests_resolve_with_the_response() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .cmd_tx
            .send(SessionCommand::Request {
                procedure: "getHeight".to_string(),
                data: Value::Null,
                response: reply_tx,
            })
            .await
            .unwrap();

        let request = harness.remote.try_next().await.unwrap().unwrap();
        let id = match request {
            WireMessage::RpcRequest { id, procedure, .. } => {
                assert_eq!(procedure, "getHeight");
                id
            }
            other => panic!("expected an rpc request, got {other:?}"),
        };

        harness
            .remote
            .send(WireMessage::RpcResponse {
                id,
                result: Ok(b"{\"height\": 55}".to_vec()),
            })
            .await
            .unwrap();

        let value = reply_rx.await.unwrap().unwrap();
        assert_eq!(value["height"], 55);
    }

    #[tokio::test]
    async fn falsy_response_bodies_are_response_errors() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .cmd_tx
            .send(SessionCommand::Request {
                procedure: "getHeight".to_string(),
                data: Value::Null,
                response: reply_tx,
            })
            .await
            .unwrap();

        let id = match harness.remote.try_next().await.unwrap().unwrap() {
            WireMessage::RpcRequest { id, .. } => id,
            other => panic!("expected an rpc request, got {other:?}"),
        };
        harness
            .remote
            .send(WireMessage::RpcResponse {
                id,
                result: Ok(b"null".to_vec()),
            })
            .await
            .unwrap();

        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(P2pError::RpcResponseError { .. })
        ));
    }

    #[tokio::test]
    async fn rpc_timeout_disconnects_the_peer() {
        let mut config = test_config();
        config.ack_timeout = Duration::from_millis(50);
        let mut harness = spawn_session(PeerKind::Inbound, config);
        let _ = next_event(&mut harness.events).await; // Opened

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .cmd_tx
            .send(SessionCommand::Request {
                procedure: "getHeight".to_string(),
                data: Value::Null,
                response: reply_tx,
            })
            .await
            .unwrap();

        // Never answer; the caller sees a timeout and the session closes.
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(P2pError::RpcTimeout { .. })
        ));
        loop {
            match next_event(&mut harness.events).await {
                SessionEvent::Closed { code, .. } => {
                    assert_eq!(code, FAILED_TO_RESPOND_CODE);
                    break;
                }
                _ => continue,
            }
        }
        let bye_or_request = harness.remote.try_next().await.unwrap().unwrap();
        assert!(matches!(bye_or_request, WireMessage::RpcRequest { .. }));
        let bye = harness.remote.try_next().await.unwrap().unwrap();
        assert!(matches!(
            bye,
            WireMessage::Bye { code: FAILED_TO_RESPOND_CODE, .. }
        ));
    }

    #[traced_test]
    #[tokio::test]
    async fn cumulative_penalties_ban_exactly_once() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .cmd_tx
            .send(SessionCommand::ApplyPenalty(40))
            .await
            .unwrap();
        harness
            .cmd_tx
            .send(SessionCommand::ApplyPenalty(60))
            .await
            .unwrap();
        // Another penalty after the ban fired must not emit a second ban.
        harness
            .cmd_tx
            .send(SessionCommand::ApplyPenalty(100))
            .await
            .unwrap();

        let mut ban_count = 0;
        loop {
            match next_event(&mut harness.events).await {
                SessionEvent::BanPeer { .. } => ban_count += 1,
                SessionEvent::Closed { code, .. } => {
                    assert_eq!(code, FORBIDDEN_CONNECTION_CODE);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(ban_count, 1);

        let bye = harness.remote.try_next().await.unwrap().unwrap();
        assert!(matches!(
            bye,
            WireMessage::Bye { code: FORBIDDEN_CONNECTION_CODE, .. }
        ));
    }

    #[tokio::test]
    async fn remote_bye_closes_with_sanitized_reason() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::Bye {
                code: EVICTED_PEER_CODE,
                reason: "<script>alert(1)</script>".to_string(),
            })
            .await
            .unwrap();

        loop {
            match next_event(&mut harness.events).await {
                SessionEvent::Closed { code, reason, .. } => {
                    assert_eq!(code, EVICTED_PEER_CODE);
                    assert_eq!(reason, "Evicted to free a connection slot");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn pings_are_answered_with_pongs() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .remote
            .send(WireMessage::Ping { nonce: 1234 })
            .await
            .unwrap();
        let pong = harness.remote.try_next().await.unwrap().unwrap();
        assert_eq!(pong, WireMessage::Pong { nonce: 1234 });
    }

    #[tokio::test]
    async fn disconnect_command_sends_bye_and_closes() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .cmd_tx
            .send(SessionCommand::Disconnect {
                code: EVICTED_PEER_CODE,
                reason: "Evicted to free a connection slot".to_string(),
            })
            .await
            .unwrap();

        loop {
            match next_event(&mut harness.events).await {
                SessionEvent::Closed { code, .. } => {
                    assert_eq!(code, EVICTED_PEER_CODE);
                    break;
                }
                _ => continue,
            }
        }
        let bye = harness.remote.try_next().await.unwrap().unwrap();
        assert!(matches!(bye, WireMessage::Bye { code: EVICTED_PEER_CODE, .. }));
        assert!(harness.handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn node_info_goes_out_as_a_message_on_inbound_sessions() {
        let mut harness = spawn_session(PeerKind::Inbound, test_config());
        let _ = next_event(&mut harness.events).await; // Opened

        let mut node_info = dummy_node_info();
        node_info.height = 99;
        harness
            .cmd_tx
            .send(SessionCommand::ApplyNodeInfo(node_info))
            .await
            .unwrap();

        let frame = harness.remote.try_next().await.unwrap().unwrap();
        match frame {
            WireMessage::Message { event, data } => {
                assert_eq!(event, EVENT_NODE_INFO_CHANGED);
                let value: Value = serde_json::from_slice(&data).unwrap();
                assert_eq!(value["height"], 99);
            }
            other => panic!("expected a message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_outgoing_payloads_are_not_sent() {
        let mut config = test_config();
        config.ws_max_payload_inbound = 64;
        let mut harness = spawn_session(PeerKind::Inbound, config);
        let _ = next_event(&mut harness.events).await; // Opened

        harness
            .cmd_tx
            .send(SessionCommand::Send {
                event: "bar".to_string(),
                data: json!("x".repeat(512)),
            })
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut harness.events).await,
            SessionEvent::FailedToSendMessage { .. }
        ));
        // The session is still alive and well.
        harness
            .remote
            .send(WireMessage::Ping { nonce: 7 })
            .await
            .unwrap();
        let pong = harness.remote.try_next().await.unwrap().unwrap();
        assert_eq!(pong, WireMessage::Pong { nonce: 7 });
    }

    #[tokio::test]
    async fn eof_from_the_remote_emits_closed_once() {
        // Teacher-style scripted stream: nothing but EOF.
        let mock = tokio_test::io::Builder::new().build();
        let stream = wrap_stream(mock, 1 << 16);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, mut events) = mpsc::channel(16);
        let session = PeerSession::new(
            dummy_peer_info(),
            PeerKind::Inbound,
            dummy_node_info(),
            test_config(),
            event_tx,
            cmd_tx,
        );
        session.run(stream, cmd_rx).await.unwrap();

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn scripted_byte_stream_matches_the_codec() {
        // Sanity-check the to_bytes helper against a real framed read.
        let message = WireMessage::Ping { nonce: 3 };
        let mock = tokio_test::io::Builder::new()
            .read(&to_bytes(&message))
            .build();
        let mut stream = wrap_stream(mock, 1 << 16);
        let received = stream.try_next().await.unwrap().unwrap();
        assert_eq!(received, message);
    }
}
