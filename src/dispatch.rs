//! Dispatch adapter: decoded request in, encoded response out.
//!
//! Framing succeeded by the time a packet reaches this stage, so nothing
//! here fails the connection: unknown targets, duplicate correlation ids and
//! parse failures all become responses carrying a wire error code. The one
//! exception is a write-deadline expiry, which cancels the invocation and
//! answers nothing (timeouts are local-only, never serialized).

use crate::proto::{
    codec_of, ConnRole, ConnState, MethodKey, ProtocolId, RawPacket, Request, Response, SpHead,
    SpType,
};
use crate::registry::{CallContext, ServiceRegistry};
use bytes::Bytes;
use polyrpc_core::error::{errno, RpcError};
use polyrpc_core::TimeoutSetting;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct DispatchAdapter {
    registry: Arc<ServiceRegistry>,
    defaults: TimeoutSetting,
}

impl DispatchAdapter {
    pub fn new(registry: Arc<ServiceRegistry>, defaults: TimeoutSetting) -> Self {
        Self { registry, defaults }
    }

    /// Serve one request-direction packet to completion: resolve, invoke,
    /// encode. `None` means nothing goes on the wire (cancelled by deadline).
    pub async fn handle_request(
        &self, protocol: ProtocolId, packet: RawPacket, inflight: &Mutex<HashSet<u64>>,
    ) -> Option<Bytes> {
        let codec = codec_of(protocol);
        let mut req = Request::default();
        if let Err(e) = codec.decode_request(packet, &mut req) {
            warn!("request decode failed on {:?}: {}", protocol, e);
            let resp = self.error_response(&req, &e);
            return self.encode(protocol, &resp);
        }
        let log_id = req.log_id;
        let sp_typ = req.sp_head.map(|h| h.typ);

        // heartbeat: an empty method with an empty body is answered here
        if req.method == MethodKey::Name(String::new()) && req.body.is_empty() && req.ns_head.is_none()
        {
            trace!("ping on log_id {}", log_id);
            let resp = Response { log_id, ..Default::default() };
            return self.encode(protocol, &resp);
        }

        if !inflight.lock().expect("inflight lock").insert(log_id) {
            warn!("duplicate log_id {} on one connection", log_id);
            let e = RpcError::service(errno::EREQUEST, format!("duplicate log id {}", log_id));
            let resp = self.error_response(&req, &e);
            return self.encode(protocol, &resp);
        }
        let out = self.invoke(protocol, req).await;
        inflight.lock().expect("inflight lock").remove(&log_id);
        let mut resp = out?;
        if let Some(typ) = sp_typ {
            let answer =
                if typ == SpType::PushRequest { SpType::PushResponse } else { SpType::Response };
            resp.sp_head = Some(SpHead::new(answer, resp.log_id));
        }
        self.encode(protocol, &resp)
    }

    async fn invoke(&self, protocol: ProtocolId, mut req: Request) -> Option<Response> {
        let desc = if protocol == ProtocolId::NsHead {
            // nshead carries no routing; the registry names one target
            match self.registry.nshead_binding() {
                Some(desc) => {
                    req.service_name = desc.service_name.clone();
                    req.method = MethodKey::Name(desc.method_name.clone());
                    Some(desc)
                }
                None => None,
            }
        } else {
            self.registry.lookup(&req.service_name, &req.method)
        };
        let desc = match desc {
            Some(desc) => desc,
            None => {
                let code = if self.registry.has_service(&req.service_name) {
                    errno::ENOMETHOD
                } else {
                    errno::ENOSERVICE
                };
                let e = RpcError::service(
                    code,
                    format!("no target for {}.{}", req.service_name, req.method),
                );
                info!("{}", e);
                return Some(self.error_response(&req, &e));
            }
        };
        let deadline = self.write_deadline(&req);
        let log_id = req.log_id;
        let ctx = CallContext::new(&mut req);
        let fut = (desc.invoker)(req, ctx);
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(e)) => {
                info!("invocation {}.{} failed: {}", desc.service_name, desc.method_name, e);
                let code = if e.code != 0 { e.code } else { errno::EINTERNAL };
                Some(Response {
                    log_id,
                    error: Some((code, e.message)),
                    ..Default::default()
                })
            }
            Err(_) => {
                // cancellation drops the invocation and its buffers; the
                // timeout itself is never serialized
                warn!(
                    "invocation {}.{} cancelled by write deadline",
                    desc.service_name, desc.method_name
                );
                None
            }
        }
    }

    fn write_deadline(&self, req: &Request) -> Duration {
        req.write_timeout.unwrap_or(self.defaults.write_timeout)
    }

    fn error_response(&self, req: &Request, e: &RpcError) -> Response {
        let mut resp = Response::from_error(req.log_id, e);
        if let Some(head) = req.sp_head {
            let answer = if head.typ == SpType::PushRequest {
                SpType::PushResponse
            } else {
                SpType::Response
            };
            resp.sp_head = Some(SpHead::new(answer, req.log_id));
        }
        resp.json_body = req.json_body;
        resp
    }

    fn encode(&self, protocol: ProtocolId, resp: &Response) -> Option<Bytes> {
        // response encoding is stateless on every protocol
        let mut conn = ConnState::new(ConnRole::Server);
        match codec_of(protocol).encode_response(resp, &mut conn) {
            Ok(buf) => Some(buf),
            Err(e) => {
                error!("response encode failed on {:?}: {}", protocol, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::baidu::BaiduStdCodec;
    use crate::proto::ProtocolCodec;
    use polyrpc_core::compress;
    use polyrpc_core::CompressType;

    #[derive(Clone, PartialEq, prost::Message)]
    struct EchoRequest {
        #[prost(string, tag = "1")]
        message: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct EchoResponse {
        #[prost(string, tag = "1")]
        message: String,
    }

    fn adapter() -> DispatchAdapter {
        let mut registry = ServiceRegistry::new();
        registry
            .register("echo.EchoService", "Echo", |req: EchoRequest, _ctx| async move {
                Ok(EchoResponse { message: req.message })
            })
            .expect("register");
        DispatchAdapter::new(Arc::new(registry), TimeoutSetting::default())
    }

    fn baidu_request(log_id: u64, service: &str, method: &str) -> RawPacket {
        let mut req = Request {
            log_id,
            service_name: service.to_string(),
            method: MethodKey::Name(method.to_string()),
            body: compress::compress_input(
                CompressType::None,
                &EchoRequest { message: "hi".to_string() },
            )
            .expect("encode"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let wire = BaiduStdCodec.encode_request(&mut req, &mut conn).expect("encode");
        let mut acc = polyrpc_core::BufferStore::new();
        acc.append(wire);
        BaiduStdCodec.decode(&mut acc, &mut conn).expect("decode")
    }

    fn decode_response(buf: Bytes) -> Response {
        let mut acc = polyrpc_core::BufferStore::new();
        acc.append(buf);
        let mut conn = ConnState::new(ConnRole::Client);
        let raw = BaiduStdCodec.decode(&mut acc, &mut conn).expect("decode");
        BaiduStdCodec.decode_response(raw, &mut conn).expect("decode_response")
    }

    #[tokio::test]
    async fn test_echo_dispatch() {
        let adapter = adapter();
        let inflight = Mutex::new(HashSet::new());
        let packet = baidu_request(42, "echo.EchoService", "Echo");
        let buf = adapter
            .handle_request(ProtocolId::BaiduStd, packet, &inflight)
            .await
            .expect("response");
        let resp = decode_response(buf);
        assert_eq!(resp.log_id, 42);
        assert!(resp.error.is_none());
        let out: EchoResponse =
            compress::uncompress_output(resp.compress, &resp.body).expect("decode");
        assert_eq!(out.message, "hi");
        assert!(inflight.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_is_a_response_not_a_failure() {
        let adapter = adapter();
        let inflight = Mutex::new(HashSet::new());
        let packet = baidu_request(7, "echo.EchoService", "Nope");
        let buf = adapter
            .handle_request(ProtocolId::BaiduStd, packet, &inflight)
            .await
            .expect("response");
        let resp = decode_response(buf);
        let (code, _) = resp.error.expect("error");
        assert_eq!(code, errno::ENOMETHOD);

        let packet = baidu_request(8, "nope.Service", "Echo");
        let buf = adapter
            .handle_request(ProtocolId::BaiduStd, packet, &inflight)
            .await
            .expect("response");
        let (code, _) = decode_response(buf).error.expect("error");
        assert_eq!(code, errno::ENOSERVICE);
    }

    #[tokio::test]
    async fn test_duplicate_log_id_rejected() {
        let adapter = adapter();
        let inflight = Mutex::new(HashSet::new());
        inflight.lock().expect("lock").insert(42);
        let packet = baidu_request(42, "echo.EchoService", "Echo");
        let buf = adapter
            .handle_request(ProtocolId::BaiduStd, packet, &inflight)
            .await
            .expect("response");
        let (code, text) = decode_response(buf).error.expect("error");
        assert_eq!(code, errno::EREQUEST);
        assert!(text.contains("duplicate"));
    }
}
