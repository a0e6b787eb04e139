//! Request and response body types shared by the HTTP and FastCGI paths.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};

/// Boxed error type carried by bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type passed to and returned from handlers.
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// Body with the given contents.
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Empty body.
pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Box any body with compatible data and error types.
pub fn boxed<B>(body: B) -> Body
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}
