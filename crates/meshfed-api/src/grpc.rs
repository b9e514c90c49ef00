//! Federation discovery wire protocol
//!
//! One bidirectional gRPC stream per peer pair carries full-state resource
//! announcements. The messages are implemented as native Rust types with
//! hand-written prost impls (the reference schema lives in
//! `proto/federation.proto`; codegen stays disabled so builds do not need
//! protoc), together with the tonic client and server glue for the single
//! streaming method.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tonic::{Request, Response, Status, Streaming};

/// Resource type identifier for federated service announcements.
pub const FEDERATED_SERVICE_TYPE_URL: &str = "federation.meshfed.io/v1alpha1/FederatedService";

/// Fully qualified gRPC method path of the federation stream.
pub const STREAM_METHOD_PATH: &str =
    "/meshfed.discovery.v1alpha1.FederationDiscovery/StreamFederatedResources";

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "meshfed.discovery.v1alpha1.FederationDiscovery";

/// Proto message definitions with hand-written prost impls
pub mod proto {
    use serde::{Deserialize, Serialize};

    /// Subscription or acknowledgment sent by the consuming peer.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct DiscoveryRequest {
        /// Resource type being subscribed to or acknowledged.
        pub type_url: String,
        /// Nonce of the response being acknowledged; empty on the initial
        /// subscription.
        pub response_nonce: String,
        /// Populated when the peer rejected the previous response.
        pub error_detail: String,
    }

    /// One opaque resource payload.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct Resource {
        pub type_url: String,
        pub value: Vec<u8>,
    }

    /// Full-state announcement pushed by the serving peer.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct DiscoveryResponse {
        pub type_url: String,
        /// Server-assigned nonce, echoed back by the peer.
        pub nonce: String,
        /// Complete current state for the resource type.
        pub resources: Vec<Resource>,
    }

    impl prost::Message for DiscoveryRequest {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.type_url.is_empty() {
                prost::encoding::string::encode(1, &self.type_url, buf);
            }
            if !self.response_nonce.is_empty() {
                prost::encoding::string::encode(2, &self.response_nonce, buf);
            }
            if !self.error_detail.is_empty() {
                prost::encoding::string::encode(3, &self.error_detail, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
                2 => prost::encoding::string::merge(wire_type, &mut self.response_nonce, buf, ctx),
                3 => prost::encoding::string::merge(wire_type, &mut self.error_detail, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.type_url.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.type_url);
            }
            if !self.response_nonce.is_empty() {
                len += prost::encoding::string::encoded_len(2, &self.response_nonce);
            }
            if !self.error_detail.is_empty() {
                len += prost::encoding::string::encoded_len(3, &self.error_detail);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for Resource {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.type_url.is_empty() {
                prost::encoding::string::encode(1, &self.type_url, buf);
            }
            if !self.value.is_empty() {
                prost::encoding::bytes::encode(2, &self.value, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
                2 => prost::encoding::bytes::merge(wire_type, &mut self.value, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.type_url.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.type_url);
            }
            if !self.value.is_empty() {
                len += prost::encoding::bytes::encoded_len(2, &self.value);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for DiscoveryResponse {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.type_url.is_empty() {
                prost::encoding::string::encode(1, &self.type_url, buf);
            }
            if !self.nonce.is_empty() {
                prost::encoding::string::encode(2, &self.nonce, buf);
            }
            for resource in &self.resources {
                prost::encoding::message::encode(3, resource, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
                2 => prost::encoding::string::merge(wire_type, &mut self.nonce, buf, ctx),
                3 => {
                    let mut resource = Resource::default();
                    prost::encoding::message::merge(wire_type, &mut resource, buf, ctx)?;
                    self.resources.push(resource);
                    Ok(())
                }
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.type_url.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.type_url);
            }
            if !self.nonce.is_empty() {
                len += prost::encoding::string::encoded_len(2, &self.nonce);
            }
            for resource in &self.resources {
                len += prost::encoding::message::encoded_len(3, resource);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }
}

/// Client for the federation discovery stream.
#[derive(Clone)]
pub struct FederationDiscoveryClient {
    inner: tonic::client::Grpc<tonic::transport::Channel>,
}

impl FederationDiscoveryClient {
    pub fn new(channel: tonic::transport::Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Raise the per-message decoding limit (full-state announcements can be
    /// large).
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_decoding_message_size(limit);
        self
    }

    /// Open the bidirectional federation stream.
    pub async fn stream_federated_resources(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = proto::DiscoveryRequest>,
    ) -> Result<Response<Streaming<proto::DiscoveryResponse>>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {e}")))?;
        let codec: tonic_prost::ProstCodec<proto::DiscoveryRequest, proto::DiscoveryResponse> =
            tonic_prost::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(STREAM_METHOD_PATH);
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}

/// Federation discovery service trait
#[tonic::async_trait]
pub trait FederationDiscovery: Send + Sync + 'static {
    /// Server streaming response type for StreamFederatedResources
    type StreamFederatedResourcesStream: Stream<Item = Result<proto::DiscoveryResponse, Status>>
        + Send
        + 'static;

    /// Full-state bidirectional federation stream
    async fn stream_federated_resources(
        &self,
        request: Request<Streaming<proto::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamFederatedResourcesStream>, Status>;
}

/// Transport wrapper mounting a [`FederationDiscovery`] implementation on a
/// tonic server.
pub struct FederationDiscoveryServer<T> {
    inner: Arc<T>,
}

impl<T> FederationDiscoveryServer<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for FederationDiscoveryServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: FederationDiscovery> tower::Service<http::Request<tonic::body::Body>>
    for FederationDiscoveryServer<T>
{
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        match req.uri().path() {
            STREAM_METHOD_PATH => {
                struct StreamSvc<T>(Arc<T>);

                impl<T: FederationDiscovery>
                    tonic::server::StreamingService<proto::DiscoveryRequest> for StreamSvc<T>
                {
                    type Response = proto::DiscoveryResponse;
                    type ResponseStream = T::StreamFederatedResourcesStream;
                    type Future = Pin<
                        Box<
                            dyn Future<
                                    Output = Result<Response<Self::ResponseStream>, Status>,
                                > + Send,
                        >,
                    >;

                    fn call(
                        &mut self,
                        request: Request<Streaming<proto::DiscoveryRequest>>,
                    ) -> Self::Future {
                        let inner = Arc::clone(&self.0);
                        Box::pin(async move { inner.stream_federated_resources(request).await })
                    }
                }

                let inner = Arc::clone(&self.inner);
                Box::pin(async move {
                    let codec: tonic_prost::ProstCodec<
                        proto::DiscoveryResponse,
                        proto::DiscoveryRequest,
                    > = tonic_prost::ProstCodec::default();
                    let mut grpc = tonic::server::Grpc::new(codec);
                    Ok(grpc.streaming(StreamSvc(inner), req).await)
                })
            }
            _ => Box::pin(async move {
                let mut response = http::Response::new(tonic::body::Body::default());
                response.headers_mut().insert(
                    "grpc-status",
                    http::HeaderValue::from(tonic::Code::Unimplemented as i32),
                );
                response.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/grpc"),
                );
                Ok(response)
            }),
        }
    }
}

impl<T: FederationDiscovery> tonic::server::NamedService for FederationDiscoveryServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}
