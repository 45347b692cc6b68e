//! Server-originated calls.
//!
//! A [PushConn] wraps one accepted connection's writer and a correlation
//! map; [PushCaller] is the explicit caller object for one remote method,
//! built from the same descriptor vocabulary as server-side registration,
//! with no proxies and no runtime synthesis. The connection reader completes
//! the pending futures when push responses come back.

use crate::proto::push::SERVER_PUSH_CODEC;
use crate::proto::{
    ConnRole, ConnState, MethodKey, ProtocolCodec, RawPacket, Request, Response, SpHead, SpType,
};
use crate::registry::MethodDescriptor;
use bytes::Bytes;
use polyrpc_core::compress;
use polyrpc_core::error::RpcError;
use polyrpc_core::{CompressType, TimeoutSetting};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

pub struct PushConn {
    /// Dropped on retire so the connection writer can drain and exit.
    writer: Mutex<Option<crossfire::MTx<Bytes>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Response, RpcError>>>>,
    seq: AtomicU64,
    timeout: TimeoutSetting,
    retired: AtomicBool,
    /// Set once the connection has spoken the push protocol.
    capable: AtomicBool,
}

impl PushConn {
    pub fn new(writer: crossfire::MTx<Bytes>, timeout: TimeoutSetting) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            timeout,
            retired: AtomicBool::new(false),
            capable: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn capable(&self) -> bool {
        self.capable.load(Ordering::SeqCst)
    }

    pub fn mark_capable(&self) {
        self.capable.store(true, Ordering::SeqCst);
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let _ = self.writer.lock().expect("writer lock").take();
    }

    fn send(&self, buf: Bytes) -> Result<(), RpcError> {
        match self.writer.lock().expect("writer lock").as_ref() {
            Some(tx) if tx.send(buf).is_ok() => Ok(()),
            _ => Err(RpcError::network("connection writer is gone")),
        }
    }

    /// Resolve the pending future a push response answers. Called by the
    /// connection reader.
    pub fn complete(&self, packet: RawPacket, conn: &mut ConnState) {
        match SERVER_PUSH_CODEC.decode_response(packet, conn) {
            Ok(resp) => {
                let waiter = self.pending.lock().expect("pending lock").remove(&resp.log_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(resp));
                    }
                    None => warn!("push response {} has no waiter", resp.log_id),
                }
            }
            Err(e) => warn!("push response decode failed: {}", e),
        }
    }

    /// Fail every outstanding push call; used when the connection dies.
    pub fn cancel_all(&self, err: RpcError) {
        let mut pending = self.pending.lock().expect("pending lock");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// One server-originated call over this connection.
    pub async fn call(&self, mut req: Request) -> Result<Response, RpcError> {
        if self.retired() {
            return Err(RpcError::network("connection is gone"));
        }
        let log_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        req.log_id = log_id;
        req.sp_head = Some(SpHead::new(SpType::PushRequest, log_id));
        let mut conn = ConnState::new(ConnRole::Server);
        let buf = SERVER_PUSH_CODEC.encode_request(&mut req, &mut conn)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(log_id, tx);
        if let Err(e) = self.send(buf) {
            self.pending.lock().expect("pending lock").remove(&log_id);
            return Err(e);
        }
        match tokio::time::timeout(self.timeout.read_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::network("connection closed")),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&log_id);
                Err(RpcError::timeout(format!("push call {} timed out", log_id)))
            }
        }
    }
}

/// Caller object for one client-resident method.
pub struct PushCaller {
    conn: std::sync::Arc<PushConn>,
    service_name: String,
    method_name: String,
}

impl PushCaller {
    pub fn new(conn: std::sync::Arc<PushConn>, service: &str, method: &str) -> Self {
        Self {
            conn,
            service_name: service.to_string(),
            method_name: method.to_string(),
        }
    }

    pub fn from_descriptor(conn: std::sync::Arc<PushConn>, desc: &MethodDescriptor) -> Self {
        Self::new(conn, &desc.service_name, &desc.method_name)
    }

    /// Invoke the remote method; resolves when the push response arrives.
    pub async fn invoke<M, R>(&self, msg: &M) -> Result<R, RpcError>
    where
        M: prost::Message,
        R: prost::Message + Default,
    {
        let body = compress::compress_input(CompressType::None, msg)?;
        let req = Request {
            service_name: self.service_name.clone(),
            method: MethodKey::Name(self.method_name.clone()),
            body,
            ..Default::default()
        };
        let resp = self.conn.call(req).await?;
        if let Some((code, text)) = resp.error {
            return Err(RpcError::service(code, text));
        }
        compress::uncompress_output(resp.compress, &resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[tokio::test]
    async fn test_call_resolves_on_push_response() {
        let (tx, rx) = crossfire::mpsc::unbounded_async::<Bytes>();
        let conn = std::sync::Arc::new(PushConn::new(tx, TimeoutSetting::default()));
        let caller = PushCaller::new(conn.clone(), "push.Notifier", "Notify");

        let responder = {
            let conn = conn.clone();
            tokio::spawn(async move {
                // read the encoded push request off the channel and answer it
                let wire = rx.recv().await.expect("push request");
                let mut acc = polyrpc_core::BufferStore::new();
                acc.append(wire);
                let mut state = ConnState::new(ConnRole::Client);
                let raw = SERVER_PUSH_CODEC.decode(&mut acc, &mut state).expect("decode");
                let mut req = Request::default();
                SERVER_PUSH_CODEC.decode_request(raw, &mut req).expect("decode_request");
                assert_eq!(req.sp_head.expect("sp head").typ, SpType::PushRequest);

                let note: Note =
                    compress::uncompress_input(req.compress, &req.body).expect("parse");
                let resp = Response {
                    log_id: req.log_id,
                    body: compress::compress_output(
                        CompressType::None,
                        &Note { text: format!("ack: {}", note.text) },
                    )
                    .expect("encode"),
                    sp_head: Some(SpHead::new(SpType::PushResponse, req.log_id)),
                    ..Default::default()
                };
                let wire =
                    SERVER_PUSH_CODEC.encode_response(&resp, &mut state).expect("encode");
                let mut acc = polyrpc_core::BufferStore::new();
                acc.append(wire);
                let raw = SERVER_PUSH_CODEC.decode(&mut acc, &mut state).expect("decode");
                conn.complete(raw, &mut state);
            })
        };

        let out: Note = caller.invoke(&Note { text: "hello".to_string() }).await.expect("invoke");
        assert_eq!(out.text, "ack: hello");
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let (tx, _rx) = crossfire::mpsc::unbounded_async::<Bytes>();
        let conn = std::sync::Arc::new(PushConn::new(tx, TimeoutSetting::default()));
        let caller = PushCaller::new(conn.clone(), "push.Notifier", "Notify");
        let call = tokio::spawn(async move {
            caller.invoke::<Note, Note>(&Note { text: "x".to_string() }).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        conn.cancel_all(RpcError::network("gone"));
        let err = call.await.expect("join").unwrap_err();
        assert_eq!(err.kind, polyrpc_core::error::RpcErrorKind::NetworkError);
    }
}
