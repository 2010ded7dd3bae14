//! Offload Core - runtime for calling native functions in a remote process.
//!
//! A client hands a module to a server, then calls the module's functions by
//! signature token. Arguments travel as hex text over TCP or as raw native
//! bytes through a shared memory segment; array arguments are copied out and
//! back so the caller's memory reflects the remote execution.
//!
//! # Example
//!
//! ```rust,ignore
//! use offload_core::{kernels, Arg, OffloadClient, StreamClientTransport};
//!
//! #[tokio::main]
//! async fn main() -> offload_core::Result<()> {
//!     let addr = "127.0.0.1:55055".parse().expect("address");
//!     let transport = StreamClientTransport::connect(addr).await?;
//!     let mut client = OffloadClient::new(transport);
//!     client.initialise(kernels::ADD).await?;
//!
//!     let reply = client
//!         .call(kernels::ADD, &mut [Arg::scalar(3), Arg::scalar(4)])
//!         .await?;
//!     println!("3 + 4 = {:?}", reply.value);
//!
//!     client.close().await
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod decision;
pub mod error;
pub mod hexfloat;
pub mod marshal;
pub mod server;
pub mod signature;
pub mod timing;
pub mod transport;
pub mod types;
pub mod unmarshal;
pub mod wire;

// Re-export commonly used types
pub use backend::{kernels, Backend, FunctionHandle, ModuleLoader, NativeFunctionTable};
pub use client::OffloadClient;
pub use config::{CommType, ShmemConfig, StreamConfig};
pub use decision::{CallPath, DecisionOutcome, OffloadDecisionSite};
pub use error::{exit_on_fatal, OffloadError, Result};
pub use marshal::{CallReply, Marshaler, PendingArrayUpdate};
pub use server::{ServerSession, SessionState, SessionSummary, StreamServer, StreamServerHandle};
pub use signature::{FunctionSignature, SignatureCodec};
pub use timing::{TimeMeasure, TimeMeasureLog};
pub use transport::stream::{StreamClientTransport, StreamServerTransport};
#[cfg(unix)]
pub use transport::shmem::{ShmemClientTransport, ShmemServerTransport};
pub use transport::{ClientTransport, ReadySignal, ServerTransport};
pub use types::{Arg, ArrayBuffer, ArrayMut, Scalar, ScalarType, Value, ValueType};
pub use unmarshal::Unmarshaler;
pub use wire::WireFormat;
