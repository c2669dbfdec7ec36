//! Client side of the SOCKS5 connection-establishment handshake (RFC 1928).
//!
//! The handshake is a byte-exact state machine with variable-length framing:
//! the length of the server's reply depends on the ATYP tag inside the reply
//! header. `Socks5Handshake` keeps the protocol logic free of I/O: each event
//! returns a [`StreamOp`] telling the driver what to put on the wire and how
//! many bytes to read next, so exactly one sized read is outstanding at any
//! time.

use bytes::{BufMut, Bytes, BytesMut};

use easy_error::{Error, bail};

use crate::target::{AddrFamily, TargetAddr};

pub const SOCKS_VER_5: u8 = 5u8;
pub const SOCKS_CMD_CONNECT: u8 = 1u8;
pub const SOCKS_AUTH_NONE: u8 = 0u8;
pub const SOCKS_ATYP_INET4: u8 = 1u8;
pub const SOCKS_ATYP_DOMAIN: u8 = 3u8;
pub const SOCKS_ATYP_INET6: u8 = 4u8;

/// VER, NMETHODS=1, METHODS=[NO_AUTH]
const GREETING: &[u8] = &[SOCKS_VER_5, 1, SOCKS_AUTH_NONE];

/// Server's method-selection reply: version + selected method.
pub const METHOD_SELECTION_LEN: usize = 2;
/// VER, REP, RSV, ATYP and the first address byte.
pub const REPLY_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Connecting,
    AwaitingMethodSelection,
    AwaitingReplyHeader,
    /// Holds the trailing byte count computed from the reply header.
    AwaitingReplyBody { remaining: usize },
    Forwarding,
    Failed,
}

/// What the state machine wants its driver to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamOp {
    /// Open the transport to the proxy server.
    Connect,
    /// Write `data` in one send, then read exactly `then_read` bytes.
    Send { data: Bytes, then_read: usize },
    /// Read exactly this many bytes.
    Recv(usize),
    /// Handshake complete, the channel is ready to forward.
    Ready,
    /// Pass these bytes through to the downstream side verbatim.
    Relay(Bytes),
    /// Nothing to do in the current state.
    Ignore,
}

/// One SOCKS5 handshake attempt bound to a single target. Create a fresh
/// instance per connection; the instance is not reusable after it reaches
/// `Forwarding` or `Failed`.
#[derive(Debug)]
pub struct Socks5Handshake {
    target: TargetAddr,
    state: HandshakeState,
    cancelled: bool,
}

impl Socks5Handshake {
    pub fn new(target: TargetAddr) -> Self {
        Self {
            target,
            state: HandshakeState::Idle,
            cancelled: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Best-effort cancellation, observed only at [`open_connection`].
    ///
    /// [`open_connection`]: Self::open_connection
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Start the handshake. Returns `None` without any state transition if
    /// cancellation was observed or the handshake already started.
    pub fn open_connection(&mut self) -> Option<StreamOp> {
        if self.cancelled || self.state != HandshakeState::Idle {
            return None;
        }
        self.state = HandshakeState::Connecting;
        Some(StreamOp::Connect)
    }

    /// The transport to the proxy is up: send the greeting and wait for the
    /// 2-byte method-selection reply.
    pub fn connected(&mut self) -> Result<StreamOp, Error> {
        if self.state != HandshakeState::Connecting {
            bail!("connect completed in state {:?}", self.state);
        }
        self.state = HandshakeState::AwaitingMethodSelection;
        Ok(StreamOp::Send {
            data: Bytes::from_static(GREETING),
            then_read: METHOD_SELECTION_LEN,
        })
    }

    /// Feed bytes read from the proxy. During the handshake `data` must be
    /// exactly the count requested by the previous [`StreamOp`]; in
    /// `Forwarding` any chunk is relayed as-is.
    pub fn bytes_received(&mut self, data: &[u8]) -> Result<StreamOp, Error> {
        match self.state {
            HandshakeState::AwaitingMethodSelection => {
                if data.len() != METHOD_SELECTION_LEN {
                    return self.fail(format!(
                        "expected {} byte method selection, got {}",
                        METHOD_SELECTION_LEN,
                        data.len()
                    ));
                }
                if let Err(e) = validate_method_selection(data) {
                    self.state = HandshakeState::Failed;
                    return Err(e);
                }
                let request = match connect_request(&self.target) {
                    Ok(r) => r,
                    Err(e) => {
                        self.state = HandshakeState::Failed;
                        return Err(e);
                    }
                };
                self.state = HandshakeState::AwaitingReplyHeader;
                Ok(StreamOp::Send {
                    data: request,
                    then_read: REPLY_HEADER_LEN,
                })
            }
            HandshakeState::AwaitingReplyHeader => {
                if data.len() != REPLY_HEADER_LEN {
                    return self.fail(format!(
                        "expected {} byte reply header, got {}",
                        REPLY_HEADER_LEN,
                        data.len()
                    ));
                }
                let remaining = match reply_trailer_len(data) {
                    Ok(n) => n,
                    Err(e) => {
                        self.state = HandshakeState::Failed;
                        return Err(e);
                    }
                };
                self.state = HandshakeState::AwaitingReplyBody { remaining };
                Ok(StreamOp::Recv(remaining))
            }
            HandshakeState::AwaitingReplyBody { remaining } => {
                if data.len() != remaining {
                    return self.fail(format!(
                        "expected {} byte reply trailer, got {}",
                        remaining,
                        data.len()
                    ));
                }
                self.state = HandshakeState::Forwarding;
                Ok(StreamOp::Ready)
            }
            HandshakeState::Forwarding => Ok(StreamOp::Relay(Bytes::copy_from_slice(data))),
            _ => Ok(StreamOp::Ignore),
        }
    }

    /// A write to the proxy finished. Only meaningful while forwarding, where
    /// the returned count feeds the caller's flow-control accounting.
    pub fn write_completed(&self, len: usize) -> Option<usize> {
        if self.state == HandshakeState::Forwarding {
            Some(len)
        } else {
            None
        }
    }

    fn fail(&mut self, msg: String) -> Result<StreamOp, Error> {
        self.state = HandshakeState::Failed;
        bail!("{}", msg)
    }
}

/// Accepts any 2-byte reply as a successful negotiation. The selected method
/// byte is not inspected; a stricter mode would reject replies where it is
/// not `SOCKS_AUTH_NONE`.
fn validate_method_selection(_data: &[u8]) -> Result<(), Error> {
    Ok(())
}

/// `05 01 00 <ATYP> <ADDR...> <PORT_be>`, address encoding chosen by the
/// target's family.
fn connect_request(target: &TargetAddr) -> Result<Bytes, Error> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VER_5);
    buf.put_u8(SOCKS_CMD_CONNECT);
    buf.put_u8(0); // RSV
    match target.family() {
        AddrFamily::Ipv4(ip) => {
            buf.put_u8(SOCKS_ATYP_INET4);
            buf.put_slice(&ip.octets());
        }
        AddrFamily::Ipv6(ip) => {
            buf.put_u8(SOCKS_ATYP_INET6);
            buf.put_slice(&ip.octets());
        }
        AddrFamily::Domain => {
            let name = target.host().as_bytes();
            if name.is_empty() || name.len() > 255 {
                bail!("domain name length out of range: {}", name.len());
            }
            buf.put_u8(SOCKS_ATYP_DOMAIN);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
        }
    }
    buf.put_u16(target.port());
    Ok(buf.freeze())
}

/// How many bytes follow the 5-byte reply header, per its ATYP tag. The
/// header already carries the first address byte, which for a domain reply is
/// the length prefix.
fn reply_trailer_len(header: &[u8]) -> Result<usize, Error> {
    match header[3] {
        SOCKS_ATYP_INET4 => Ok(3 + 2),
        SOCKS_ATYP_DOMAIN => Ok(header[4] as usize + 2),
        SOCKS_ATYP_INET6 => Ok(15 + 2),
        atyp => bail!("unsupported address type in reply: {}", atyp),
    }
}
