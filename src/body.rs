//! Body types shared by the pipeline and the transport
//!
//! Both directions stream: nothing here buffers a whole message.

use crate::error::BoxError;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};

/// Body of every response the proxy writes, upstream or local
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Body of every request handed to a transport
pub type OutboundBody = BoxBody<Bytes, BoxError>;

/// Create full body
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Empty request body, used for every redirect hop
pub fn empty_outbound() -> OutboundBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Erase the concrete type of an inbound body so it can be forwarded as is
pub fn outbound<B>(body: B) -> OutboundBody
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}
