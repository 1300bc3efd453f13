//! Dispatch of gRPC calls to dynamically registered services.
//!
//! The listener's route table is fixed when it starts, but registrations
//! change on every reload. All paths not claimed by a static route fall
//! through to `DynamicDispatch`, which looks the service up in the live
//! registration table on each call.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::HeaderValue;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::body::BoxBody;
use tonic::server::{Grpc, UnaryService};
use tonic::Status;
use tower::Service;
use tracing::debug;

use super::ServiceRegistration;
use crate::codec::DynamicCodec;

pub(crate) type RegistrationTable = Arc<RwLock<HashMap<String, Arc<ServiceRegistration>>>>;

/// Fallback service routing `/{service}/{method}` through the registration table.
#[derive(Clone)]
pub(crate) struct DynamicDispatch {
    table: RegistrationTable,
    max_decoding: Option<usize>,
    max_encoding: Option<usize>,
}

impl DynamicDispatch {
    pub(crate) fn new(
        table: RegistrationTable,
        max_decoding: Option<usize>,
        max_encoding: Option<usize>,
    ) -> Self {
        Self {
            table,
            max_decoding,
            max_encoding,
        }
    }

    fn resolve(&self, path: &str) -> Option<UnaryCall> {
        let (service, method) = path.strip_prefix('/')?.split_once('/')?;
        let registration = self.table.read().ok()?.get(service)?.clone();
        let method = registration
            .descriptor
            .methods()
            .find(|m| m.name() == method)?;
        if method.is_client_streaming() || method.is_server_streaming() {
            return None;
        }
        Some(UnaryCall {
            registration,
            method,
        })
    }
}

impl<B> Service<http::Request<B>> for DynamicDispatch
where
    B: http_body::Body + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let Some(call) = self.resolve(request.uri().path()) else {
            debug!(path = %request.uri().path(), "No registration for path");
            return Box::pin(async { Ok(unimplemented()) });
        };

        let codec = DynamicCodec::new(call.method.input());
        let mut grpc =
            Grpc::new(codec).apply_max_message_size_config(self.max_decoding, self.max_encoding);
        Box::pin(async move { Ok(grpc.unary(call, request).await) })
    }
}

/// Response for a path with no registered unary method.
fn unimplemented() -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        "grpc-status",
        HeaderValue::from(tonic::Code::Unimplemented as i32),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    response
}

/// One unary call bound to its registration.
struct UnaryCall {
    registration: Arc<ServiceRegistration>,
    method: MethodDescriptor,
}

impl UnaryService<DynamicMessage> for UnaryCall {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<tonic::Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let registration = self.registration.clone();
        let method = self.method.clone();

        Box::pin(async move {
            let mapping = registration.mapping;
            let input = mapping.to_json(request.get_ref())?;
            let output = registration.instance.call(method.name(), input).await?;
            let message = mapping
                .from_json(method.output(), output)
                .map_err(|status| Status::internal(status.message().to_string()))?;
            Ok(tonic::Response::new(message))
        })
    }
}
