//! Wire bridge between the client and the engine.
//!
//! # Architecture
//!
//! - **protocol**: Message envelopes (Request/Response/Event) and typed bodies
//! - **codec**: `Content-Length` framing codec for AsyncRead/AsyncWrite
//! - **framed**: message-at-a-time reader and writer built on the codec

pub mod codec;
pub mod framed;
pub mod protocol;
