//! RPC client connection.
//!
//! One connection, one chosen protocol. Calls are matched to responses by
//! correlation id, so responses may arrive in any order; every in-flight
//! call on a connection is failed with a network error when the connection
//! dies. Push requests arriving from the server dispatch into the client's
//! own handler registry and answer back over the same connection.

use crate::dispatch::DispatchAdapter;
use crate::framing::FramingEngine;
use crate::proto::{
    codec_of, ConnRole, MethodKey, ProtocolId, RawPacket, Request, Response,
};
use crate::registry::ServiceRegistry;
use bytes::Bytes;
use polyrpc_core::compress;
use polyrpc_core::error::{RpcError, RpcErrorKind};
use polyrpc_core::{CompressType, RpcConfig};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: ProtocolId,
    /// Encode-side protocol state (gRPC preface, stream ids).
    conn_state: Mutex<crate::proto::ConnState>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Response, RpcError>>>>,
    seq: AtomicU64,
    closed: AtomicBool,
    config: RpcConfig,
    push_dispatch: Option<Arc<DispatchAdapter>>,
}

impl RpcClient {
    pub async fn connect(addr: &str, protocol: ProtocolId, config: RpcConfig) -> io::Result<Self> {
        Self::connect_inner(addr, protocol, config, None).await
    }

    /// Connect with a handler registry for server-originated calls.
    pub async fn connect_with_push(
        addr: &str, protocol: ProtocolId, config: RpcConfig, handlers: Arc<ServiceRegistry>,
    ) -> io::Result<Self> {
        let dispatch = Arc::new(DispatchAdapter::new(handlers, config.timeout.clone()));
        Self::connect_inner(addr, protocol, config, Some(dispatch)).await
    }

    async fn connect_inner(
        addr: &str, protocol: ProtocolId, config: RpcConfig,
        push_dispatch: Option<Arc<DispatchAdapter>>,
    ) -> io::Result<Self> {
        let stream = tokio::time::timeout(
            config.timeout.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(ClientInner {
            protocol,
            conn_state: Mutex::new(crate::proto::ConnState::new(ConnRole::Client)),
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
            push_dispatch,
        });
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            reader_inner.receive_loop(read_half).await;
        });
        Ok(Self { inner })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// One call on the wire. The request's log id is assigned here unless
    /// the caller chose one; the response future resolves when the matching
    /// correlation id comes back.
    pub async fn call(&self, req: Request) -> Result<Response, RpcError> {
        self.inner.call(req).await
    }

    /// Typed protobuf call.
    pub async fn call_message<M, R>(
        &self, service: &str, method: MethodKey, msg: &M, ct: CompressType,
    ) -> Result<R, RpcError>
    where
        M: prost::Message,
        R: prost::Message + Default,
    {
        let req = Request {
            service_name: service.to_string(),
            method,
            compress: ct,
            body: compress::compress_input(ct, msg)?,
            ..Default::default()
        };
        let resp = self.call(req).await?;
        if let Some((code, text)) = resp.error {
            return Err(RpcError::service(code, text));
        }
        compress::uncompress_output(resp.compress, &resp.body)
    }

    /// Typed JSON call over the HTTP codec.
    pub async fn call_json<M, R>(&self, service: &str, method: &str, msg: &M) -> Result<R, RpcError>
    where
        M: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let req = Request {
            service_name: service.to_string(),
            method: MethodKey::Name(method.to_string()),
            body: compress::compress_json(CompressType::None, msg)?,
            json_body: true,
            ..Default::default()
        };
        let resp = self.call(req).await?;
        if let Some((code, text)) = resp.error {
            return Err(RpcError::service(code, text));
        }
        compress::uncompress_json(resp.compress, &resp.body)
    }
}

impl ClientInner {
    async fn call(self: &Arc<Self>, mut req: Request) -> Result<Response, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::network("connection is closed"));
        }
        if req.log_id == 0 {
            req.log_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        }
        let deadline = req.read_timeout.unwrap_or(self.config.timeout.read_timeout);
        let codec = codec_of(self.protocol);
        let buf = {
            let mut conn = self.conn_state.lock().expect("conn state lock");
            codec.encode_request(&mut req, &mut conn)?
        };
        let log_id = req.log_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(log_id, tx);
        if let Err(e) = self.write(buf).await {
            self.pending.lock().expect("pending lock").remove(&log_id);
            return Err(e.into());
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::network("connection closed")),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&log_id);
                Err(RpcError::timeout(format!("call {} timed out", log_id)))
            }
        }
    }

    async fn write(&self, buf: Bytes) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await
    }

    async fn receive_loop(self: Arc<Self>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut engine = FramingEngine::new_bound(ConnRole::Client, self.protocol);
        let push_inflight = Mutex::new(HashSet::new());
        let mut chunk = vec![0u8; self.config.read_chunk_size];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let packets = match engine.feed(Bytes::copy_from_slice(&chunk[..n])) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!("client connection fatal: {}", e);
                    break;
                }
            };
            if let Some(control) = engine.take_control() {
                if self.write(control).await.is_err() {
                    break;
                }
            }
            for framed in packets {
                self.handle_packet(framed.packet, &mut engine, &push_inflight).await;
            }
            if engine.is_fatal() {
                warn!("client connection poisoned, closing");
                break;
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all(RpcError::network("connection closed"));
        trace!("client receive loop exits");
    }

    async fn handle_packet(
        self: &Arc<Self>, packet: RawPacket, engine: &mut FramingEngine,
        push_inflight: &Mutex<HashSet<u64>>,
    ) {
        // server-originated requests route to the push handler registry
        if let RawPacket::Push { head, .. } = &packet {
            if head.typ.is_request() {
                match &self.push_dispatch {
                    Some(dispatch) => {
                        if let Some(buf) = dispatch
                            .handle_request(ProtocolId::ServerPush, packet, push_inflight)
                            .await
                        {
                            if self.write(buf).await.is_err() {
                                warn!("push response write failed");
                            }
                        }
                    }
                    None => warn!("push request dropped: no handlers registered"),
                }
                return;
            }
        }
        // gRPC resets resolve the one stream they name, not the connection
        let grpc_stream = match &packet {
            RawPacket::Grpc(call) => Some(call.stream_id as u64),
            _ => None,
        };
        let codec = codec_of(self.protocol);
        match codec.decode_response(packet, engine.conn()) {
            Ok(resp) => self.resolve(resp.log_id, Ok(resp)),
            Err(e) => match grpc_stream {
                Some(log_id) if e.kind == RpcErrorKind::NetworkError => {
                    self.resolve(log_id, Err(e));
                }
                _ => warn!("response decode failed: {}", e),
            },
        }
    }

    fn resolve(&self, log_id: u64, result: Result<Response, RpcError>) {
        match self.pending.lock().expect("pending lock").remove(&log_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!("response {} has no waiting call", log_id),
        }
    }

    fn cancel_all(&self, err: RpcError) {
        let mut pending = self.pending.lock().expect("pending lock");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}
