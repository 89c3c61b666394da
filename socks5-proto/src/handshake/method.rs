/// A SOCKS5 handshake method octet (RFC 1928 §3).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct HandshakeMethod(pub u8);

impl HandshakeMethod {
    /// `0x00` — no authentication required.
    pub const NO_AUTH: Self = Self(0x00);
    /// `0x02` — username/password sub-negotiation (RFC 1929).
    pub const USER_PASS: Self = Self(0x02);
    /// `0xff` — "no acceptable methods" (NOAC), sent by the server when it
    /// can satisfy none of the client's offered methods.
    pub const NO_ACCEPTABLE: Self = Self(0xff);
}

impl From<u8> for HandshakeMethod {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<HandshakeMethod> for u8 {
    fn from(value: HandshakeMethod) -> Self {
        value.0
    }
}
