//! RPC server: accept loop plus a reader/writer coroutine pair per
//! connection.
//!
//! The reader owns the connection's framing engine and hands decoded
//! requests to the dispatch adapter; completed responses reach the writer
//! through a channel, so they go out as they finish, not in arrival order,
//! and the correlation id matches them up. HTTP/1.1 is the exception: its
//! requests are served inline to keep responses in request order.

use crate::dispatch::DispatchAdapter;
use crate::framing::FramingEngine;
use crate::proto::{ConnRole, ProtocolId, RawPacket};
use crate::push::PushConn;
use crate::registry::ServiceRegistry;
use bytes::Bytes;
use polyrpc_core::error::RpcError;
use polyrpc_core::RpcConfig;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct RpcServer {
    registry: Arc<ServiceRegistry>,
    config: RpcConfig,
    dispatch: Arc<DispatchAdapter>,
    conn_ref_count: Arc<()>,
    listeners: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    push_conns: Arc<Mutex<Vec<Arc<PushConn>>>>,
}

impl RpcServer {
    pub fn new(registry: Arc<ServiceRegistry>, config: RpcConfig) -> Self {
        let dispatch =
            Arc::new(DispatchAdapter::new(registry.clone(), config.timeout.clone()));
        Self {
            registry,
            config,
            dispatch,
            conn_ref_count: Arc::new(()),
            listeners: Mutex::new(Vec::new()),
            push_conns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Connections that can take server-originated calls: bound to the push
    /// protocol and still alive.
    pub fn push_conns(&self) -> Vec<Arc<PushConn>> {
        self.push_conns
            .lock()
            .expect("push conns lock")
            .iter()
            .filter(|c| c.capable() && !c.retired())
            .cloned()
            .collect()
    }

    pub async fn listen(&self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);
        let dispatch = self.dispatch.clone();
        let config = self.config.clone();
        let conn_ref_count = self.conn_ref_count.clone();
        let push_conns = self.push_conns.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Err(e) => {
                        warn!("accept error on {}: {}", local_addr, e);
                        return;
                    }
                    Ok((stream, peer)) => {
                        debug!("accepted {}", peer);
                        serve_conn(
                            stream,
                            dispatch.clone(),
                            config.clone(),
                            conn_ref_count.clone(),
                            push_conns.clone(),
                        );
                    }
                }
            }
        });
        self.listeners.lock().expect("listeners lock").push(handle);
        Ok(local_addr)
    }

    #[inline]
    fn alive_conns(&self) -> usize {
        Arc::strong_count(&self.conn_ref_count) - 1
    }

    /// Gracefully close: stop accepting, then wait a bounded time for live
    /// connections to drain.
    pub async fn close(&self) {
        for handle in self.listeners.lock().expect("listeners lock").drain(..) {
            handle.abort();
        }
        let start = Instant::now();
        while self.alive_conns() > 0 {
            if start.elapsed() > self.config.server_close_wait {
                warn!("closing with {} connection(s) still alive", self.alive_conns());
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("server closed");
    }
}

fn serve_conn(
    stream: TcpStream, dispatch: Arc<DispatchAdapter>, config: RpcConfig,
    conn_ref_count: Arc<()>, push_conns: Arc<Mutex<Vec<Arc<PushConn>>>>,
) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string());
    let (mut read_half, mut write_half) = stream.into_split();
    let (resp_tx, resp_rx) = crossfire::mpsc::unbounded_async::<Bytes>();

    let push_conn = Arc::new(PushConn::new(resp_tx.clone(), config.timeout.clone()));
    push_conns.lock().expect("push conns lock").push(push_conn.clone());

    // writer: drain the channel, batch flushes
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        let _conn_ref = conn_ref_count;
        while let Ok(buf) = resp_rx.recv().await {
            if write_half.write_all(&buf).await.is_err() {
                break;
            }
            while let Ok(more) = resp_rx.try_recv() {
                if write_half.write_all(&more).await.is_err() {
                    return;
                }
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        trace!("{} writer exits", writer_peer);
        let _ = write_half.shutdown().await;
    });

    // reader: owns the framing engine, feeds the dispatch adapter
    tokio::spawn(async move {
        let mut engine = FramingEngine::new(ConnRole::Server);
        let inflight = Arc::new(Mutex::new(HashSet::new()));
        let mut chunk = vec![0u8; config.read_chunk_size];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let packets = match engine.feed(Bytes::copy_from_slice(&chunk[..n])) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!("{} connection fatal: {}", peer, e);
                    push_conn.cancel_all(RpcError::network(format!("connection fatal: {}", e)));
                    break;
                }
            };
            if let Some(control) = engine.take_control() {
                if resp_tx.send(control).is_err() {
                    break;
                }
            }
            let fatal = engine.is_fatal();
            for framed in packets {
                // push responses coming back from the peer resolve the
                // server-side caller futures instead of dispatching
                if framed.protocol == ProtocolId::ServerPush {
                    push_conn.mark_capable();
                    if let RawPacket::Push { head, .. } = &framed.packet {
                        if !head.typ.is_request() {
                            push_conn.complete(framed.packet, engine.conn());
                            continue;
                        }
                    }
                }
                if framed.protocol == ProtocolId::Http {
                    // serve inline: pipelined responses stay in request order
                    if let Some(buf) =
                        dispatch.handle_request(framed.protocol, framed.packet, &inflight).await
                    {
                        if resp_tx.send(buf).is_err() {
                            return;
                        }
                    }
                    continue;
                }
                let dispatch = dispatch.clone();
                let resp_tx = resp_tx.clone();
                let inflight = inflight.clone();
                tokio::spawn(async move {
                    if let Some(buf) =
                        dispatch.handle_request(framed.protocol, framed.packet, &inflight).await
                    {
                        let _ = resp_tx.send(buf);
                    }
                });
            }
            if fatal {
                warn!("{} connection poisoned, closing", peer);
                push_conn.cancel_all(RpcError::network("connection fatal"));
                break;
            }
        }
        push_conn.cancel_all(RpcError::network("connection closed"));
        push_conn.retire();
        push_conns.lock().expect("push conns lock").retain(|c| !c.retired());
        trace!("{} reader exits", peer);
        // dropping the last sender lets the writer exit
    });
}
