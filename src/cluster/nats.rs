//! # NATS transport.
//!
//! [`NatsRpc`] carries the call/cast surface across processes. An instance
//! subscribes to its own `(kind, index)` subject and to the `(kind, 0)`
//! broadcast subject with queue-group semantics, so one message lands on
//! exactly one subscriber per group.
//!
//! ```text
//!  call ──► REQ frame ──► target subject ──► peer registry ──► module server
//!    ▲                                                            │
//!    └────── session map ◄── ACK frame ◄── reply subject ◄── ret ─┘
//! ```
//!
//! Disconnections reconnect indefinitely with jittered exponential backoff
//! (capped at 60s); subscriptions are restored by the client on reconnect.
//! In-flight sessions across a disconnect time out unless the ACK still
//! arrives — there is no redelivery.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::app::App;
use crate::backoff::BackoffStrategy;
use crate::cluster::codec;
use crate::cluster::envelope::{AckEnvelope, ReqEnvelope, KIND_CAST, KIND_REQ};
use crate::cluster::subject::Identity;
use crate::error::{panic_message, ClusterError, RpcError};
use crate::message::Message;
use crate::rpc::RetInfo;

/// Cluster RPC endpoint bound to one `(kind, index)` identity.
pub struct NatsRpc {
    client: async_nats::Client,
    identity: Identity,
    kind: i64,
    idx: i64,
    session_seq: AtomicI64,
    sessions: DashMap<i64, oneshot::Sender<RetInfo>>,
    app: App,
    enqueue_timeout: Duration,
}

impl NatsRpc {
    /// Connects, registers the envelope types and subscribes to the own and
    /// broadcast subjects.
    pub async fn connect(
        addr: &str,
        kind: i64,
        idx: i64,
        app: App,
    ) -> Result<Arc<Self>, ClusterError> {
        if addr.is_empty() || kind <= 0 || idx <= 0 {
            return Err(ClusterError::InvalidConfig(format!(
                "addr '{addr}', kind {kind}, idx {idx}"
            )));
        }
        codec::register(ReqEnvelope::default())?;
        codec::register(AckEnvelope::default())?;

        let backoff = BackoffStrategy::default();
        let client = async_nats::ConnectOptions::new()
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => tracing::warn!("disconnected from nats"),
                    async_nats::Event::Connected => tracing::info!("reconnected to nats"),
                    other => tracing::info!("nats event: {other}"),
                }
            })
            .reconnect_delay_callback(move |attempts| backoff.jittered_nth(attempts))
            .connect(addr)
            .await
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        tracing::info!("connected to nats at {addr}");

        let enqueue_timeout = app.config().enqueue_timeout;
        let rpc = Arc::new(Self {
            client,
            identity: Identity::from_env(),
            kind,
            idx,
            session_seq: AtomicI64::new(0),
            sessions: DashMap::new(),
            app,
            enqueue_timeout,
        });

        for sub_idx in [0, idx] {
            let subject = rpc.identity.subject(kind, sub_idx);
            tracing::info!("subscribe {subject}");
            let subscriber = rpc
                .client
                .queue_subscribe(subject.clone(), subject.clone())
                .await
                .map_err(|e| ClusterError::Subscribe(e.to_string()))?;
            Self::spawn_receiver(&rpc, subscriber);
        }
        Ok(rpc)
    }

    /// Subject this instance answers from.
    pub fn self_subject(&self) -> String {
        self.identity.subject(self.kind, self.idx)
    }

    fn spawn_receiver(rpc: &Arc<Self>, mut subscriber: async_nats::Subscriber) {
        let rpc = Arc::clone(rpc);
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let rpc = Arc::clone(&rpc);
                tokio::spawn(async move {
                    if let Err(payload) =
                        AssertUnwindSafe(rpc.handle_frame(message.payload)).catch_unwind().await
                    {
                        tracing::error!(
                            "cluster message handler panicked: {}",
                            panic_message(&*payload)
                        );
                    }
                });
            }
            tracing::warn!("cluster subscription closed");
        });
    }

    async fn handle_frame(&self, frame: Bytes) {
        let payload = match codec::unmarshal(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("cluster frame decode error: {e}");
                return;
            }
        };
        let payload = match payload.downcast::<ReqEnvelope>() {
            Ok(req) => {
                self.handle_req(*req).await;
                return;
            }
            Err(payload) => payload,
        };
        match payload.downcast::<AckEnvelope>() {
            Ok(ack) => self.handle_ack(*ack),
            Err(payload) => tracing::warn!(tag = payload.tag(), "unexpected cluster frame"),
        }
    }

    /// Dispatches an incoming request to the local module by name; the
    /// handler's result is serialized back as an ACK. Casts produce no ACK.
    async fn handle_req(&self, req: ReqEnvelope) {
        let inner = match codec::unmarshal(&req.data) {
            Ok(payload) => payload,
            Err(e) => {
                self.reply_error(&req.reply, req.session_id, &e.to_string()).await;
                return;
            }
        };
        let Some(server) = self.app.server(&req.module) else {
            tracing::error!(module = %req.module, "cluster request for unknown module");
            self.reply_error(
                &req.reply,
                req.session_id,
                &format!("module {} not found", req.module),
            )
            .await;
            return;
        };
        match req.kind {
            KIND_REQ => {
                let ri = crate::rpc::call_server(&server, inner, self.enqueue_timeout).await;
                match ri.into_result() {
                    Ok(ack) => self.reply_ack(&req.reply, req.session_id, ack).await,
                    Err(e) => self.reply_error(&req.reply, req.session_id, &e.to_string()).await,
                }
            }
            KIND_CAST => {
                if let Err(e) = crate::rpc::cast_server(&server, inner) {
                    tracing::error!(module = %req.module, "cluster cast error: {e}");
                }
            }
            other => tracing::warn!(kind = other, "unknown cluster pack kind"),
        }
    }

    /// Completes the waiting session; a late ACK after timeout is dropped.
    fn handle_ack(&self, ack: AckEnvelope) {
        let Some((_, tx)) = self.sessions.remove(&ack.session_id) else {
            tracing::warn!(
                session_id = ack.session_id,
                from = %ack.from,
                "late cluster ack dropped"
            );
            return;
        };
        let ri = if !ack.error.is_empty() {
            RetInfo::from_err(RpcError::Remote(ack.error))
        } else if ack.data.is_empty() {
            RetInfo::ok(None)
        } else {
            match codec::unmarshal(&ack.data) {
                Ok(payload) => RetInfo::ok(Some(payload)),
                Err(e) => RetInfo::from_err(RpcError::Remote(e.to_string())),
            }
        };
        let _ = tx.send(ri);
    }

    async fn reply_ack(&self, reply: &str, session_id: i64, ack: Option<crate::message::Payload>) {
        if reply.is_empty() {
            return;
        }
        let data = match &ack {
            Some(payload) => match codec::marshal(payload) {
                Ok(frame) => frame.to_vec(),
                Err(e) => {
                    self.reply_error(reply, session_id, &e.to_string()).await;
                    return;
                }
            },
            None => Vec::new(),
        };
        let envelope = AckEnvelope {
            from: self.self_subject(),
            session_id,
            data,
            error: String::new(),
        };
        self.publish_envelope(reply, &envelope).await;
    }

    async fn reply_error(&self, reply: &str, session_id: i64, error: &str) {
        if reply.is_empty() {
            return;
        }
        let envelope = AckEnvelope {
            from: self.self_subject(),
            session_id,
            data: Vec::new(),
            error: error.to_string(),
        };
        self.publish_envelope(reply, &envelope).await;
    }

    async fn publish_envelope<M: Message + Serialize>(&self, subject: &str, envelope: &M) {
        match codec::marshal_message(envelope) {
            Ok(frame) => {
                if let Err(e) = self.client.publish(subject.to_string(), frame).await {
                    tracing::error!(subject, "cluster publish failed: {e}");
                }
            }
            Err(e) => tracing::error!("cluster envelope encode failed: {e}"),
        }
    }

    fn next_session(&self) -> i64 {
        self.session_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn publish_req<M: Message + Serialize>(
        &self,
        kind: i64,
        idx: i64,
        module: &str,
        message: &M,
        pack_kind: i32,
        session_id: i64,
    ) -> Result<(), ClusterError> {
        let data = codec::marshal_message(message)?.to_vec();
        let envelope = ReqEnvelope {
            reply: if pack_kind == KIND_REQ {
                self.self_subject()
            } else {
                String::new()
            },
            module: module.to_string(),
            kind: pack_kind,
            session_id,
            data,
        };
        let frame = codec::marshal_message(&envelope)?;
        self.client
            .publish(self.identity.subject(kind, idx), frame)
            .await
            .map_err(|e| ClusterError::Publish(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| ClusterError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Remote sync call; waits for the correlated ACK with no outer deadline.
    pub async fn call<M: Message + Serialize>(
        &self,
        kind: i64,
        idx: i64,
        module: &str,
        message: M,
    ) -> RetInfo {
        self.call_inner(kind, idx, module, message, None).await
    }

    /// Remote sync call bounded by `deadline`; the session is abandoned on
    /// timeout and the peer handler still runs to completion.
    pub async fn call_with_timeout<M: Message + Serialize>(
        &self,
        deadline: Duration,
        kind: i64,
        idx: i64,
        module: &str,
        message: M,
    ) -> RetInfo {
        self.call_inner(kind, idx, module, message, Some(deadline)).await
    }

    async fn call_inner<M: Message + Serialize>(
        &self,
        kind: i64,
        idx: i64,
        module: &str,
        message: M,
        deadline: Option<Duration>,
    ) -> RetInfo {
        let session_id = self.next_session();
        let (tx, rx) = oneshot::channel();
        self.sessions.insert(session_id, tx);

        if let Err(e) = self
            .publish_req(kind, idx, module, &message, KIND_REQ, session_id)
            .await
        {
            self.sessions.remove(&session_id);
            tracing::error!(module, "cluster call send error: {e}");
            return RetInfo::from_err(RpcError::Transport(e.to_string()));
        }

        match deadline {
            None => match rx.await {
                Ok(ri) => ri,
                Err(_) => RetInfo::from_err(RpcError::DroppedReply),
            },
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(ri)) => ri,
                Ok(Err(_)) => RetInfo::from_err(RpcError::DroppedReply),
                Err(_elapsed) => {
                    self.sessions.remove(&session_id);
                    tracing::warn!(module, session_id, "cluster call timed out");
                    RetInfo::from_err(RpcError::ReplyTimeout)
                }
            },
        }
    }

    /// Remote async call; `callback` is invoked off the caller's task when
    /// the ACK arrives.
    pub async fn async_call<M, F>(
        &self,
        kind: i64,
        idx: i64,
        module: &str,
        message: M,
        callback: F,
    ) -> Result<(), ClusterError>
    where
        M: Message + Serialize,
        F: FnOnce(RetInfo) + Send + 'static,
    {
        let session_id = self.next_session();
        let (tx, rx) = oneshot::channel();
        self.sessions.insert(session_id, tx);

        if let Err(e) = self
            .publish_req(kind, idx, module, &message, KIND_REQ, session_id)
            .await
        {
            self.sessions.remove(&session_id);
            tracing::error!(module, "cluster async call send error: {e}");
            return Err(e);
        }
        tokio::spawn(async move {
            if let Ok(ri) = rx.await {
                callback(ri);
            }
        });
        Ok(())
    }

    /// Remote fire-and-forget; no ACK is expected.
    pub async fn cast<M: Message + Serialize>(&self, kind: i64, idx: i64, module: &str, message: M) {
        let session_id = self.next_session();
        if let Err(e) = self
            .publish_req(kind, idx, module, &message, KIND_CAST, session_id)
            .await
        {
            tracing::error!(module, "cluster cast error: {e}");
        }
    }
}
