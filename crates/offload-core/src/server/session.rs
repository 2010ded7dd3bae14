//! Server-side session state machine.
//!
//! ```text
//! AwaitingModule ──▶ Ready ──▶ AwaitingCall ──▶ Executing ──▶ Replying
//!        │                        ▲    │                          │
//!        │                        │    └──────▶ Closed            │
//!        └──────▶ Closed          └───────────────────────────────┘
//! ```
//!
//! Every failure ends the session with an error; peer close and the
//! shared-segment termination byte end it normally.

use super::dispatcher::Dispatcher;
use crate::backend::ModuleLoader;
use crate::error::{OffloadError, Result};
use crate::transport::{ReadySignal, ServerTransport};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingModule,
    Ready,
    AwaitingCall,
    Executing,
    Replying,
    Closed,
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    /// `None` if the client left before sending a module.
    pub ready: Option<ReadySignal>,
    pub calls: u64,
}

/// One client's session: a module, its backend and the call loop.
pub struct ServerSession<T, L> {
    transport: T,
    loader: Arc<L>,
    state: SessionState,
}

impl<T, L> ServerSession<T, L>
where
    T: ServerTransport,
    L: ModuleLoader,
{
    pub fn new(transport: T, loader: Arc<L>) -> Self {
        Self {
            transport,
            loader,
            state: SessionState::AwaitingModule,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion and release the transport.
    pub async fn run(mut self) -> Result<SessionSummary> {
        let result = self.serve().await;
        self.state = SessionState::Closed;
        let closed = self.transport.close().await;
        let summary = result?;
        closed?;
        Ok(summary)
    }

    async fn serve(&mut self) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();

        let module_text = match self.transport.receive_module().await? {
            Some(text) => text,
            None => {
                debug!("Client left before sending a module");
                return Ok(summary);
            }
        };

        let (mut dispatcher, ready) =
            load_module(self.loader.clone(), module_text, self.transport.wire_format()).await?;
        self.state = SessionState::Ready;
        self.transport.send_ready(ready).await?;
        summary.ready = Some(ready);
        info!(
            "Module ready (optimize {}µs, backend init {}µs)",
            ready.optimize_micros, ready.init_micros
        );

        loop {
            self.state = SessionState::AwaitingCall;
            let payload = match self.transport.receive_call().await? {
                Some(payload) => payload,
                None => break,
            };

            self.state = SessionState::Executing;
            let (returned, reply) = tokio::task::spawn_blocking(move || {
                let reply = dispatcher.handle_call(&payload);
                (dispatcher, reply)
            })
            .await
            .map_err(|e| OffloadError::Other(format!("call task failed: {}", e)))?;
            dispatcher = returned;
            let reply = reply?;

            self.state = SessionState::Replying;
            self.transport.send_reply(&reply).await?;
            summary.calls += 1;
        }

        info!("Session closed after {} calls", summary.calls);
        Ok(summary)
    }
}

/// Optimize the module and initialise a backend, timing both steps.
pub async fn load_module<L: ModuleLoader>(
    loader: Arc<L>,
    module_text: String,
    format: crate::wire::WireFormat,
) -> Result<(Dispatcher, ReadySignal)> {
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let module = loader.optimize(&module_text)?;
        let optimize_micros = micros_since(start);

        let start = Instant::now();
        let backend = loader.init_backend(module)?;
        let init_micros = micros_since(start);

        Ok((
            Dispatcher::new(backend, format),
            ReadySignal {
                optimize_micros,
                init_micros,
            },
        ))
    })
    .await
    .map_err(|e| OffloadError::Other(format!("module task failed: {}", e)))?
}

fn micros_since(start: Instant) -> i64 {
    start.elapsed().as_micros().min(i64::MAX as u128) as i64
}
