//! HTTP/1.1 wire codec
//!
//! [`HttpDecoder`] reads heads and framed bodies off a stream;
//! [`HttpEncoder`] writes them back out. Both sides of the proxy use the
//! same codec: the client-facing session decodes requests and encodes
//! responses, the origin client does the reverse.

mod decoder;
mod encoder;

pub use decoder::{
    request_framing, response_framing, BodyFraming, BodyReader, HttpDecoder, OwnedBodyReader,
    RequestHead, ResponseHead,
};
pub use encoder::{prepare_response_framing, reason_phrase, HttpEncoder};
