//! Meta registry: `(service, method name)` and `(service, method index)` to
//! an invocable descriptor. Registration happens once at server startup and
//! rejects duplicates; lookups after that are read-only and contention-free.
//!
//! The invoker is an erased async closure created at registration time from
//! the typed handler, so the hot path never inspects message types.

use crate::proto::{MethodKey, NsHeadInfo, Request, Response};
use bytes::Bytes;
use polyrpc_core::error::{errno, RpcError};
use polyrpc_core::compress;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type Invoker =
    Arc<dyn Fn(Request, Arc<CallContext>) -> BoxFuture<Result<Response, RpcError>> + Send + Sync>;

/// Body form the registered handler parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodEncoding {
    Protobuf,
    Json,
}

/// Per-call context handed to the handler: request attachments in, response
/// attachment out.
pub struct CallContext {
    pub log_id: u64,
    pub kv_attachment: Vec<(String, String)>,
    pub attachment: Option<Bytes>,
    resp_attachment: Mutex<Option<Bytes>>,
}

impl CallContext {
    pub fn new(req: &mut Request) -> Arc<Self> {
        Arc::new(Self {
            log_id: req.log_id,
            kv_attachment: std::mem::take(&mut req.kv_attachment),
            attachment: req.attachment.take(),
            resp_attachment: Mutex::new(None),
        })
    }

    /// Attach opaque bytes to the response, outside the message schema.
    pub fn set_response_attachment(&self, attachment: Bytes) {
        *self.resp_attachment.lock().expect("attachment lock") = Some(attachment);
    }

    pub fn take_response_attachment(&self) -> Option<Bytes> {
        self.resp_attachment.lock().expect("attachment lock").take()
    }
}

pub struct MethodDescriptor {
    pub service_name: String,
    pub method_name: String,
    /// Proto method sequence within the service, counted from 0; Hulu
    /// addresses the method by this number.
    pub method_index: i32,
    pub encoding: MethodEncoding,
    pub ns_head: Option<NsHeadInfo>,
    pub invoker: Invoker,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method {service}.{method} is already registered")]
    Duplicate { service: String, method: String },
    #[error("nshead binding already taken by {0}")]
    NsHeadTaken(String),
}

#[derive(Default)]
pub struct ServiceRegistry {
    by_name: HashMap<String, HashMap<String, Arc<MethodDescriptor>>>,
    by_index: HashMap<String, HashMap<i32, Arc<MethodDescriptor>>>,
    /// NSHead carries no routing on the wire; one method per server owns it.
    nshead_binding: Option<Arc<MethodDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protobuf-typed method.
    pub fn register<Req, Resp, F, Fut>(
        &mut self, service: &str, method: &str, handler: F,
    ) -> Result<(), RegistryError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let invoker = proto_invoker(handler);
        self.add(service, method, MethodEncoding::Protobuf, None, invoker)
    }

    /// Register a JSON-typed method, reachable through the HTTP codec.
    pub fn register_json<Req, Resp, F, Fut>(
        &mut self, service: &str, method: &str, handler: F,
    ) -> Result<(), RegistryError>
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + 'static,
        F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |mut req: Request, ctx: Arc<CallContext>| {
            let handler = handler.clone();
            Box::pin(async move {
                let log_id = req.log_id;
                let ct = req.compress;
                let msg: Req = compress::uncompress_json(ct, &req.body)?;
                req.body = Bytes::new();
                let out = handler(msg, ctx.clone()).await?;
                let body = compress::compress_json(ct, &out)?;
                Ok(Response {
                    log_id,
                    compress: ct,
                    body,
                    attachment: ctx.take_response_attachment(),
                    json_body: true,
                    ..Default::default()
                })
            })
        });
        self.add(service, method, MethodEncoding::Json, None, invoker)
    }

    /// Register a protobuf method and bind it as the connection-wide target
    /// for NSHead traffic.
    pub fn register_nshead<Req, Resp, F, Fut>(
        &mut self, service: &str, method: &str, info: NsHeadInfo, handler: F,
    ) -> Result<(), RegistryError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        if let Some(taken) = &self.nshead_binding {
            return Err(RegistryError::NsHeadTaken(format!(
                "{}.{}",
                taken.service_name, taken.method_name
            )));
        }
        let invoker = proto_invoker(handler);
        self.add(service, method, MethodEncoding::Protobuf, Some(info), invoker)?;
        let desc = self.by_name[service][method].clone();
        self.nshead_binding = Some(desc);
        Ok(())
    }

    fn add(
        &mut self, service: &str, method: &str, encoding: MethodEncoding,
        ns_head: Option<NsHeadInfo>, invoker: Invoker,
    ) -> Result<(), RegistryError> {
        let methods = self.by_name.entry(service.to_string()).or_default();
        if methods.contains_key(method) {
            return Err(RegistryError::Duplicate {
                service: service.to_string(),
                method: method.to_string(),
            });
        }
        let method_index = methods.len() as i32;
        let desc = Arc::new(MethodDescriptor {
            service_name: service.to_string(),
            method_name: method.to_string(),
            method_index,
            encoding,
            ns_head,
            invoker,
        });
        methods.insert(method.to_string(), desc.clone());
        self.by_index.entry(service.to_string()).or_default().insert(method_index, desc);
        Ok(())
    }

    pub fn lookup(&self, service: &str, method: &MethodKey) -> Option<Arc<MethodDescriptor>> {
        match method {
            MethodKey::Name(name) => self.by_name.get(service)?.get(name).cloned(),
            MethodKey::Index(idx) => self.by_index.get(service)?.get(idx).cloned(),
        }
    }

    pub fn nshead_binding(&self) -> Option<Arc<MethodDescriptor>> {
        self.nshead_binding.clone()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.by_name.contains_key(service)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn proto_invoker<Req, Resp, F, Fut>(handler: F) -> Invoker
where
    Req: prost::Message + Default + 'static,
    Resp: prost::Message + 'static,
    F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |mut req: Request, ctx: Arc<CallContext>| {
        let handler = handler.clone();
        Box::pin(async move {
            if req.json_body {
                return Err(RpcError::service(
                    errno::EREQUEST,
                    "method takes a protobuf body, not json",
                ));
            }
            let log_id = req.log_id;
            let ct = req.compress;
            let msg: Req = compress::uncompress_input(ct, &req.body)?;
            req.body = Bytes::new();
            let out = handler(msg, ctx.clone()).await?;
            let body = compress::compress_output(ct, &out)?;
            Ok(Response {
                log_id,
                compress: ct,
                body,
                attachment: ctx.take_response_attachment(),
                ..Default::default()
            })
        })
    })
}
