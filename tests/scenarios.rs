//! End-to-end scenarios over loopback TCP: every wire protocol against one
//! server, protocol latching, oversize handling, correlation, attachments,
//! and server push.

use bytes::Bytes;
use captains_log::*;
use polyrpc::client::RpcClient;
use polyrpc::proto::baidu::BaiduStdCodec;
use polyrpc::proto::hulu::HuluCodec;
use polyrpc::proto::{ConnRole, ConnState, MethodKey, NsHeadInfo, ProtocolCodec, ProtocolId, Request};
use polyrpc::registry::ServiceRegistry;
use polyrpc::server::RpcServer;
use polyrpc::{CompressType, RpcConfig, RpcErrorKind};
use polyrpc_core::compress;
use rstest::*;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Serialize, Deserialize)]
pub struct JsonEcho {
    pub message: String,
}

pub struct TestRunner {
    rt: tokio::runtime::Runtime,
}

impl TestRunner {
    fn new() -> Self {
        let _ = recipe::raw_file_logger("/tmp/polyrpc_test.log", Level::Trace).test().build();
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .expect("runtime"),
        }
    }

    fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, _f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Ok(())
    }
}

#[fixture]
fn runner() -> TestRunner {
    TestRunner::new()
}

fn echo_registry() -> Arc<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    for service in ["echo.EchoService", "example_for_cpp.EchoService"] {
        registry
            .register(service, "Echo", |req: EchoRequest, ctx| async move {
                if let Some(att) = &ctx.attachment {
                    ctx.set_response_attachment(att.clone());
                }
                Ok(EchoResponse { message: req.message })
            })
            .expect("register");
    }
    registry
        .register_json("example.EchoService", "Echo", |req: JsonEcho, _ctx| async move {
            Ok(JsonEcho { message: req.message })
        })
        .expect("register json");
    registry
        .register_nshead(
            "legacy.EchoService",
            "Echo",
            NsHeadInfo { id: 1, version: 1, provider: [0u8; 16] },
            |req: EchoRequest, _ctx| async move { Ok(EchoResponse { message: req.message }) },
        )
        .expect("register nshead");
    Arc::new(registry)
}

async fn start_server() -> (Arc<RpcServer>, String) {
    let server = Arc::new(RpcServer::new(echo_registry(), RpcConfig::default()));
    let addr = server.listen("127.0.0.1:0").await.expect("listen");
    (server, addr.to_string())
}

#[rstest]
fn test_baidu_echo_with_chosen_log_id(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::BaiduStd, RpcConfig::default())
            .await
            .expect("connect");
        let req = Request {
            log_id: 42,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            body: compress::compress_input(
                CompressType::None,
                &EchoRequest { message: "hi".to_string() },
            )
            .expect("encode"),
            ..Default::default()
        };
        let resp = client.call(req).await.expect("call");
        assert_eq!(resp.log_id, 42);
        assert!(resp.error.is_none());
        let out: EchoResponse =
            compress::uncompress_output(resp.compress, &resp.body).expect("decode");
        assert_eq!(out.message, "hi");
    });
}

#[rstest]
fn test_hulu_echo_by_method_index(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::Hulu, RpcConfig::default())
            .await
            .expect("connect");
        let resp: EchoResponse = client
            .call_message(
                "echo.EchoService",
                MethodKey::Index(0),
                &EchoRequest { message: "hi".to_string() },
                CompressType::None,
            )
            .await
            .expect("call");
        assert_eq!(resp.message, "hi");

        // a non-numeric method name must fail before any bytes are written
        let err = client
            .call_message::<EchoRequest, EchoResponse>(
                "echo.EchoService",
                MethodKey::Name("Echo".to_string()),
                &EchoRequest { message: "hi".to_string() },
                CompressType::None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::SerializationFailure);
        // the connection is still usable
        let resp: EchoResponse = client
            .call_message(
                "echo.EchoService",
                MethodKey::Name("0".to_string()),
                &EchoRequest { message: "again".to_string() },
                CompressType::None,
            )
            .await
            .expect("call");
        assert_eq!(resp.message, "again");
    });
}

#[rstest]
fn test_sofa_echo(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::Sofa, RpcConfig::default())
            .await
            .expect("connect");
        let resp: EchoResponse = client
            .call_message(
                "echo.EchoService",
                MethodKey::Name("Echo".to_string()),
                &EchoRequest { message: "sofa".to_string() },
                CompressType::None,
            )
            .await
            .expect("call");
        assert_eq!(resp.message, "sofa");
    });
}

#[rstest]
fn test_grpc_echo(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::Grpc, RpcConfig::default())
            .await
            .expect("connect");
        let resp: EchoResponse = client
            .call_message(
                "example_for_cpp.EchoService",
                MethodKey::Name("Echo".to_string()),
                &EchoRequest { message: "hi".to_string() },
                CompressType::None,
            )
            .await
            .expect("call");
        assert_eq!(resp.message, "hi");

        // unknown method surfaces as a non-zero grpc-status, not a hang
        let err = client
            .call_message::<EchoRequest, EchoResponse>(
                "example_for_cpp.EchoService",
                MethodKey::Name("Nope".to_string()),
                &EchoRequest { message: "hi".to_string() },
                CompressType::None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RpcErrorKind::ServiceException);
    });
}

#[rstest]
fn test_http_json_echo(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::Http, RpcConfig::default())
            .await
            .expect("connect");
        let resp: JsonEcho = client
            .call_json("example.EchoService", "Echo", &JsonEcho { message: "hi".to_string() })
            .await
            .expect("call");
        assert_eq!(resp.message, "hi");
    });
}

#[rstest]
fn test_nshead_echo(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::NsHead, RpcConfig::default())
            .await
            .expect("connect");
        let req = Request {
            ns_head: Some(NsHeadInfo { id: 1, version: 1, provider: [0u8; 16] }),
            body: compress::compress_input(
                CompressType::None,
                &EchoRequest { message: "legacy".to_string() },
            )
            .expect("encode"),
            ..Default::default()
        };
        let resp = client.call(req).await.expect("call");
        let out: EchoResponse =
            compress::uncompress_output(resp.compress, &resp.body).expect("decode");
        assert_eq!(out.message, "legacy");
    });
}

#[rstest]
fn test_server_push_roundtrip(runner: TestRunner) {
    runner.block_on(async {
        let (server, addr) = start_server().await;
        let mut handlers = ServiceRegistry::new();
        handlers
            .register("push.Notifier", "Notify", |req: EchoRequest, _ctx| async move {
                Ok(EchoResponse { message: format!("seen: {}", req.message) })
            })
            .expect("register");
        let client = RpcClient::connect_with_push(
            &addr,
            ProtocolId::ServerPush,
            RpcConfig::default(),
            Arc::new(handlers),
        )
        .await
        .expect("connect");
        // an ordinary call over the push protocol announces the connection
        let hello: EchoResponse = client
            .call_message(
                "echo.EchoService",
                MethodKey::Name("Echo".to_string()),
                &EchoRequest { message: "register".to_string() },
                CompressType::None,
            )
            .await
            .expect("register call");
        assert_eq!(hello.message, "register");

        // the server now lists the connection as push-capable
        let conn = loop {
            if let Some(conn) = server.push_conns().into_iter().next() {
                break conn;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        let caller = polyrpc::push::PushCaller::new(conn, "push.Notifier", "Notify");
        let out: EchoResponse = caller
            .invoke(&EchoRequest { message: "wake up".to_string() })
            .await
            .expect("invoke");
        assert_eq!(out.message, "seen: wake up");
    });
}

#[rstest]
fn test_attachment_split(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::BaiduStd, RpcConfig::default())
            .await
            .expect("connect");
        // 8-byte encoded message, 16-byte attachment
        let message = EchoRequest { message: "abcdef".to_string() };
        let body = compress::compress_input(CompressType::None, &message).expect("encode");
        assert_eq!(body.len(), 8);
        let req = Request {
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            body,
            attachment: Some(Bytes::from_static(b"0123456789abcdef")),
            ..Default::default()
        };
        let resp = client.call(req).await.expect("call");
        assert!(resp.error.is_none());
        let att = resp.attachment.expect("attachment echoed");
        assert_eq!(&att[..], b"0123456789abcdef");
        let out: EchoResponse =
            compress::uncompress_output(resp.compress, &resp.body).expect("decode");
        assert_eq!(out.message, "abcdef");
    });
}

#[rstest]
fn test_compressed_call(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr, ProtocolId::BaiduStd, RpcConfig::default())
            .await
            .expect("connect");
        let long = "x".repeat(4096);
        for ct in [CompressType::Snappy, CompressType::Gzip, CompressType::Zlib] {
            let resp: EchoResponse = client
                .call_message(
                    "echo.EchoService",
                    MethodKey::Name("Echo".to_string()),
                    &EchoRequest { message: long.clone() },
                    ct,
                )
                .await
                .expect("call");
            assert_eq!(resp.message, long);
        }
    });
}

#[rstest]
fn test_ten_interleaved_calls_correlate(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let client = Arc::new(
            RpcClient::connect(&addr, ProtocolId::BaiduStd, RpcConfig::default())
                .await
                .expect("connect"),
        );
        let mut joins = Vec::new();
        for i in 0..10u32 {
            let client = client.clone();
            joins.push(tokio::spawn(async move {
                let payload = format!("payload-{}", i);
                let resp: EchoResponse = client
                    .call_message(
                        "echo.EchoService",
                        MethodKey::Name("Echo".to_string()),
                        &EchoRequest { message: payload.clone() },
                        CompressType::None,
                    )
                    .await
                    .expect("call");
                assert_eq!(resp.message, payload, "response delivered to a stranger");
            }));
        }
        for join in joins {
            join.await.expect("join");
        }
    });
}

fn encode_baidu_request(log_id: u64, message: &str) -> Bytes {
    let mut req = Request {
        log_id,
        service_name: "echo.EchoService".to_string(),
        method: MethodKey::Name("Echo".to_string()),
        body: compress::compress_input(
            CompressType::None,
            &EchoRequest { message: message.to_string() },
        )
        .expect("encode"),
        ..Default::default()
    };
    let mut conn = ConnState::new(ConnRole::Client);
    BaiduStdCodec.encode_request(&mut req, &mut conn).expect("encode")
}

async fn read_until_eof(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) => return out,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => return out,
            Err(_) => panic!("server did not close the connection"),
        }
    }
}

#[rstest]
fn test_latched_protocol_rejects_second_codec(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        stream.write_all(&encode_baidu_request(1, "first")).await.expect("write");

        let mut hulu_req = Request {
            log_id: 2,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Index(0),
            body: compress::compress_input(
                CompressType::None,
                &EchoRequest { message: "second".to_string() },
            )
            .expect("encode"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let hulu_wire = HuluCodec.encode_request(&mut hulu_req, &mut conn).expect("encode");
        stream.write_all(&hulu_wire).await.expect("write");

        // the baidu response comes through; the hulu packet kills the
        // connection instead of being decoded by the other codec
        let bytes = read_until_eof(&mut stream).await;
        assert!(bytes.len() >= 12);
        assert_eq!(&bytes[..4], b"PRPC");
    });
}

#[rstest]
fn test_oversize_closes_connection(runner: TestRunner) {
    runner.block_on(async {
        let (_server, addr) = start_server().await;
        let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        let mut head = Vec::new();
        head.extend_from_slice(b"PRPC");
        head.extend_from_slice(&(600u32 * 1024 * 1024).to_be_bytes());
        head.extend_from_slice(&16u32.to_be_bytes());
        stream.write_all(&head).await.expect("write");
        let bytes = read_until_eof(&mut stream).await;
        assert!(bytes.is_empty(), "no response must precede the close");
    });
}
