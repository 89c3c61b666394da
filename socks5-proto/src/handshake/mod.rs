//! The SOCKS5 handshake: method negotiation only. Username/password
//! sub-negotiation is out of scope (see crate docs).

mod method;
mod request;
mod response;

pub use self::{method::HandshakeMethod, request::Request, response::Response};
