//! Transports carrying one offload session.
//!
//! A session is a module handoff followed by strictly sequential calls:
//!
//! ```text
//! client                          server
//!   send_module(text)  ───────▶   receive_module()
//!   ◀─────────  ready  ────────   send_ready(opt, init)
//!   send_call(payload) ───────▶   receive_call()
//!   receive_reply()    ◀───────   send_reply(payload)
//!   ...
//!   close()            ───────▶   receive_call() == None
//! ```
//!
//! Two implementations: a TCP byte stream (`stream`) and a shared memory
//! region gated by a semaphore pair (`shmem`, Unix only).

pub mod framing;
#[cfg(unix)]
pub mod shmem;
pub mod stream;

use crate::error::{OffloadError, Result};
use crate::wire::WireFormat;

/// Server timings reported once the module is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadySignal {
    /// Parse, verify and optimize time of the module.
    pub optimize_micros: i64,
    /// Backend initialisation time.
    pub init_micros: i64,
}

impl ReadySignal {
    /// Text form used on the stream transport: `opt:init`.
    pub fn to_text(&self) -> String {
        format!("{}:{}", self.optimize_micros, self.init_micros)
    }

    pub fn parse_text(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| OffloadError::protocol("ready signal is not ASCII"))?;
        let (opt, init) = text
            .split_once(':')
            .ok_or_else(|| OffloadError::protocol(format!("malformed ready signal '{}'", text)))?;
        let parse = |s: &str| {
            s.parse::<i64>()
                .map_err(|_| OffloadError::protocol(format!("malformed ready signal '{}'", text)))
        };
        Ok(Self {
            optimize_micros: parse(opt)?,
            init_micros: parse(init)?,
        })
    }

    /// Native form used on the shared segment: two `i64` values.
    pub fn to_native(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.optimize_micros.to_ne_bytes());
        out[8..].copy_from_slice(&self.init_micros.to_ne_bytes());
        out
    }

    pub fn from_native(bytes: &[u8; 16]) -> Self {
        let mut opt = [0u8; 8];
        let mut init = [0u8; 8];
        opt.copy_from_slice(&bytes[..8]);
        init.copy_from_slice(&bytes[8..]);
        Self {
            optimize_micros: i64::from_ne_bytes(opt),
            init_micros: i64::from_ne_bytes(init),
        }
    }
}

/// Client end of a session.
#[async_trait::async_trait]
pub trait ClientTransport: Send {
    /// Encoding this transport carries.
    fn wire_format(&self) -> WireFormat;

    /// Hand the module text to the server and wait until it is ready.
    async fn send_module(&mut self, module_text: &str) -> Result<ReadySignal>;

    async fn send_call(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait for the reply; `PeerClosed` if the server went away.
    async fn receive_reply(&mut self) -> Result<Vec<u8>>;

    /// End the session.
    async fn close(&mut self) -> Result<()>;
}

/// Server end of a session.
#[async_trait::async_trait]
pub trait ServerTransport: Send {
    fn wire_format(&self) -> WireFormat;

    /// Module text, or `None` if the client left before sending one.
    async fn receive_module(&mut self) -> Result<Option<String>>;

    async fn send_ready(&mut self, ready: ReadySignal) -> Result<()>;

    /// Next call payload, or `None` once the client ended the session.
    async fn receive_call(&mut self) -> Result<Option<Vec<u8>>>;

    async fn send_reply(&mut self, payload: &[u8]) -> Result<()>;

    /// Release the transport's resources.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_signal_text() {
        let ready = ReadySignal {
            optimize_micros: 1200,
            init_micros: 35,
        };
        assert_eq!(ready.to_text(), "1200:35");
        assert_eq!(ReadySignal::parse_text(b"1200:35").unwrap(), ready);
        assert!(ReadySignal::parse_text(b"1200").is_err());
        assert!(ReadySignal::parse_text(b"a:b").is_err());
    }

    #[test]
    fn test_ready_signal_native() {
        let ready = ReadySignal {
            optimize_micros: -1,
            init_micros: i64::MAX,
        };
        assert_eq!(ReadySignal::from_native(&ready.to_native()), ready);
    }
}
