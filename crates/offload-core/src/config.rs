//! Centralized configuration for the offload runtime.
//!
//! Constants for the stream and shared-segment transports, plus the runtime
//! `ShmemConfig` used to name the shared objects of one session.

use std::time::Duration;

/// Stream (TCP) transport configuration.
pub struct StreamConfig;

impl StreamConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 55055;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Largest call or reply payload accepted from a peer (512 MiB).
    pub const MAX_MESSAGE_SIZE: usize = (u32::MAX >> 3) as usize;
    /// Largest module text accepted during the handshake (1 MiB).
    pub const MAX_MODULE_SIZE: usize = (u32::MAX >> 12) as usize;
    /// Decimal digits allowed in a frame length header.
    pub const MAX_LENGTH_DIGITS: usize = 20;
    pub const MAX_CONNECTIONS: usize = 64;
}

/// Shared-segment transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmemConfig {
    /// Name of the shared memory object (leading `/`).
    pub region_name: String,
    /// Semaphore posted by whichever side finished writing.
    pub data_ready_name: String,
    /// Semaphore serializing the waiters on `data_ready_name`.
    pub turn_order_name: String,
    /// Size of the mapped region in bytes.
    pub size: usize,
}

impl ShmemConfig {
    pub const REGION_NAME: &'static str = "/offload_rpc_shmem";
    pub const DATA_READY_NAME: &'static str = "/offload_rpc_shmem_sem";
    pub const TURN_ORDER_NAME: &'static str = "/offload_rpc_shmem_order_sem";
    pub const DEFAULT_SIZE: usize = 512 * 1024 * 1024;
    /// Smallest usable region: the trailer plus room for a short message.
    pub const MIN_SIZE: usize = 64;

    /// Derive all three object names from a single base name.
    ///
    /// `with_base("/demo", n)` yields `/demo`, `/demo_sem` and
    /// `/demo_order_sem`.
    pub fn with_base(base: &str, size: usize) -> Self {
        let base = if base.starts_with('/') {
            base.to_string()
        } else {
            format!("/{}", base)
        };
        Self {
            data_ready_name: format!("{}_sem", base),
            turn_order_name: format!("{}_order_sem", base),
            region_name: base,
            size,
        }
    }
}

impl Default for ShmemConfig {
    fn default() -> Self {
        Self {
            region_name: Self::REGION_NAME.to_string(),
            data_ready_name: Self::DATA_READY_NAME.to_string(),
            turn_order_name: Self::TURN_ORDER_NAME.to_string(),
            size: Self::DEFAULT_SIZE,
        }
    }
}

/// Communication mechanism between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommType {
    Socket,
    SharedMem,
}

impl CommType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommType::Socket => "socket",
            CommType::SharedMem => "sharedmem",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "socket" => Some(CommType::Socket),
            "sharedmem" | "shmem" => Some(CommType::SharedMem),
            _ => None,
        }
    }
}

impl Default for CommType {
    fn default() -> Self {
        CommType::Socket
    }
}

impl std::fmt::Display for CommType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
