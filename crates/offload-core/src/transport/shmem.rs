//! Shared-segment transport.
//!
//! One client and one server exchange messages through a single mapped
//! region, gated by two named semaphores:
//!
//! - *data ready* (initially 0), posted by whichever side finished writing;
//! - *turn order* (initially 1), held while waiting on *data ready* so only
//!   one side waits at a time.
//!
//! Region layout:
//!
//! ```text
//! 0                                   size-9        size-1   size
//! [ message bytes ...               ][ len: u64 ][ writer ]
//! ```
//!
//! The module travels NUL-terminated at offset 0, the ready signal as two
//! native `i64` at offset 0, calls and replies in the native binary wire
//! encoding. The writer byte records who wrote last; a side that wins the
//! data-ready semaphore but finds its own mark re-posts and waits again.
//! A lone `;` in place of a call ends the session.

#![allow(unsafe_code)]

use super::{ClientTransport, ReadySignal, ServerTransport};
use crate::config::ShmemConfig;
use crate::error::{OffloadError, Result};
use crate::wire::WireFormat;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Byte the client writes in place of a call to end the session.
pub const TERMINATION_BYTE: u8 = b';';

const TRAILER_LEN: usize = 9;
const SPIN_RETRIES: u32 = 64;
const RETRY_BACKOFF: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Writer {
    Nobody = 0,
    Client = 1,
    Server = 2,
    /// Server tore the session down; nothing more will be written.
    ServerGone = 3,
}

impl Writer {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => Writer::Client,
            2 => Writer::Server,
            3 => Writer::ServerGone,
            _ => Writer::Nobody,
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| OffloadError::Config {
        message: format!("shared object name '{}' contains NUL", name),
    })
}

/// POSIX named semaphore.
struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: POSIX semaphores are designed for concurrent use from any thread
// (and any process); the handle is only closed in Drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn create(name: &str, initial: u32) -> Result<Self> {
        Self::open_with(name, libc::O_CREAT | libc::O_EXCL, initial)
    }

    fn open(name: &str) -> Result<Self> {
        Self::open_with(name, 0, 0)
    }

    fn open_with(name: &str, flags: libc::c_int, initial: u32) -> Result<Self> {
        let c = c_name(name)?;
        // SAFETY: `c` is a valid NUL-terminated string; mode and value are
        // only read when O_CREAT is set and are passed as promoted integers.
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                flags,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(OffloadError::transport(
                format!("sem_open {}", name),
                std::io::Error::last_os_error(),
            ));
        }
        let sem = NonNull::new(sem).ok_or_else(|| OffloadError::Transport {
            message: format!("sem_open {} returned null", name),
            source: None,
        })?;
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: `sem` came from a successful sem_open and is open
            // until Drop.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(OffloadError::transport(format!("sem_wait {}", self.name), err));
            }
        }
    }

    fn post(&self) -> Result<()> {
        // SAFETY: see `wait`.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(OffloadError::transport(
                format!("sem_post {}", self.name),
                std::io::Error::last_os_error(),
            ))
        }
    }

    /// Remove the name; returns false if it did not exist.
    fn unlink(name: &str) -> Result<bool> {
        let c = c_name(name)?;
        // SAFETY: `c` is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::NotFound {
            Ok(false)
        } else {
            Err(OffloadError::transport(format!("sem_unlink {}", name), err))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: closed exactly once, no waiter can outlive `self`.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Mapped shared memory object.
struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: String,
}

// SAFETY: access to the mapping is serialized by the semaphore protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn create(name: &str, size: usize) -> Result<Self> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        file.set_len(size as u64)
            .map_err(|e| OffloadError::transport(format!("failed to size {}", name), e))?;
        Self::map(name, &file, size)
    }

    fn open(name: &str) -> Result<Self> {
        let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            OffloadError::Transport {
                message: format!("cannot open {} (is the server running?): {}", name, e.desc()),
                source: Some(std::io::Error::from(e)),
            }
        })?;
        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| OffloadError::transport(format!("failed to stat {}", name), e))?
            .len() as usize;
        Self::map(name, &file, size)
    }

    fn map(name: &str, file: &File, size: usize) -> Result<Self> {
        if size < ShmemConfig::MIN_SIZE {
            return Err(OffloadError::Config {
                message: format!(
                    "shared region {} is {} bytes, at least {} required",
                    name,
                    size,
                    ShmemConfig::MIN_SIZE
                ),
            });
        }
        let length = NonZeroUsize::new(size).ok_or_else(|| OffloadError::Config {
            message: format!("shared region {} is empty", name),
        })?;
        // SAFETY: fresh shared mapping of a file we just opened read-write;
        // the kernel picks the address.
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(Self {
            ptr: ptr.cast(),
            len: size,
            name: name.to_string(),
        })
    }

    fn unlink(name: &str) -> Result<bool> {
        match mman::shm_unlink(name) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ENOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes available for a message.
    fn capacity(&self) -> usize {
        self.len - TRAILER_LEN
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        // SAFETY: bounds checked by callers against `capacity`; the peer
        // does not touch the region until we post.
        unsafe {
            let dst = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    fn read_at(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len);
        // SAFETY: as for `write_at`.
        unsafe {
            let src = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }

    fn writer(&self) -> Writer {
        let mut b = [0u8; 1];
        self.read_at(self.len - 1, &mut b);
        Writer::from_byte(b[0])
    }

    fn set_writer(&self, writer: Writer) {
        self.write_at(self.len - 1, &[writer as u8]);
    }

    fn message_len(&self) -> Result<usize> {
        let mut raw = [0u8; 8];
        self.read_at(self.len - TRAILER_LEN, &mut raw);
        let len = u64::from_ne_bytes(raw) as usize;
        if len > self.capacity() {
            return Err(OffloadError::protocol(format!(
                "message length {} exceeds region capacity {}",
                len,
                self.capacity()
            )));
        }
        Ok(len)
    }

    fn put_message(&self, payload: &[u8], terminated: bool) -> Result<()> {
        let needed = payload.len() + usize::from(terminated);
        if needed > self.capacity() {
            return Err(OffloadError::MessageTooLarge {
                size: needed,
                max: self.capacity(),
            });
        }
        self.write_at(0, payload);
        if terminated {
            self.write_at(payload.len(), &[0]);
        }
        self.write_at(self.len - TRAILER_LEN, &(payload.len() as u64).to_ne_bytes());
        Ok(())
    }

    fn take_message(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.message_len()?];
        self.read_at(0, &mut out);
        Ok(out)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmaps the mapping created in `map`, exactly once.
        if let Err(e) = unsafe { mman::munmap(self.ptr.cast(), self.len) } {
            warn!("munmap {} failed: {}", self.name, e);
        }
    }
}

/// Region plus semaphores, shared with blocking tasks.
struct ShmemChannel {
    region: SharedRegion,
    data_ready: NamedSemaphore,
    turn_order: NamedSemaphore,
}

impl ShmemChannel {
    /// Wait until the peer has written, and report which mark it left.
    fn acquire(&self, me: Writer) -> Result<Writer> {
        let mut retries = 0u32;
        loop {
            self.turn_order.wait()?;
            let waited = self.data_ready.wait();
            self.turn_order.post()?;
            waited?;

            let writer = self.region.writer();
            if writer != me {
                return Ok(writer);
            }
            // Our own post; hand it back and let the peer run.
            self.data_ready.post()?;
            retries += 1;
            if retries < SPIN_RETRIES {
                std::thread::yield_now();
            } else {
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
    }

    fn publish(&self, me: Writer) -> Result<()> {
        self.region.set_writer(me);
        self.data_ready.post()
    }
}

async fn blocking<T, F>(channel: &Arc<ShmemChannel>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&ShmemChannel) -> Result<T> + Send + 'static,
{
    let channel = channel.clone();
    tokio::task::spawn_blocking(move || f(&channel))
        .await
        .map_err(|e| OffloadError::Other(format!("shared segment task failed: {}", e)))?
}

/// Server side: creates the shared objects and removes them at teardown.
pub struct ShmemServerTransport {
    channel: Arc<ShmemChannel>,
    config: ShmemConfig,
    unlinked: bool,
}

impl ShmemServerTransport {
    /// Create the region and semaphores, replacing leftovers of an unclean exit.
    pub fn create(config: ShmemConfig) -> Result<Self> {
        Self::remove_objects(&config, true)?;

        let region = SharedRegion::create(&config.region_name, config.size)?;
        let data_ready = NamedSemaphore::create(&config.data_ready_name, 0)?;
        let turn_order = NamedSemaphore::create(&config.turn_order_name, 1)?;
        info!(
            "Shared segment {} ready ({} bytes)",
            config.region_name, config.size
        );

        Ok(Self {
            channel: Arc::new(ShmemChannel {
                region,
                data_ready,
                turn_order,
            }),
            config,
            unlinked: false,
        })
    }

    pub fn config(&self) -> &ShmemConfig {
        &self.config
    }

    fn remove_objects(config: &ShmemConfig, stale: bool) -> Result<()> {
        let removed = [
            SharedRegion::unlink(&config.region_name)?,
            NamedSemaphore::unlink(&config.data_ready_name)?,
            NamedSemaphore::unlink(&config.turn_order_name)?,
        ];
        if stale && removed.iter().any(|r| *r) {
            warn!(
                "Removed stale shared objects for {} left by a previous server",
                config.region_name
            );
        }
        Ok(())
    }

    fn unlink(&mut self) -> Result<()> {
        if !self.unlinked {
            self.unlinked = true;
            Self::remove_objects(&self.config, false)?;
            debug!("Unlinked shared objects for {}", self.config.region_name);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServerTransport for ShmemServerTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::NativeBinary
    }

    async fn receive_module(&mut self) -> Result<Option<String>> {
        blocking(&self.channel, |ch| {
            match ch.acquire(Writer::Server)? {
                Writer::Client => {}
                other => {
                    return Err(OffloadError::protocol(format!(
                        "expected module from client, found mark {:?}",
                        other
                    )))
                }
            }
            let bytes = ch.region.take_message()?;
            if bytes.first() == Some(&TERMINATION_BYTE) && bytes.len() == 1 {
                return Ok(None);
            }
            String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| OffloadError::protocol("module text is not valid UTF-8"))
        })
        .await
    }

    async fn send_ready(&mut self, ready: ReadySignal) -> Result<()> {
        blocking(&self.channel, move |ch| {
            ch.region.put_message(&ready.to_native(), false)?;
            ch.publish(Writer::Server)
        })
        .await
    }

    async fn receive_call(&mut self) -> Result<Option<Vec<u8>>> {
        blocking(&self.channel, |ch| {
            ch.acquire(Writer::Server)?;
            let mut first = [0u8; 1];
            ch.region.read_at(0, &mut first);
            if first[0] == TERMINATION_BYTE {
                debug!("Client ended the shared segment session");
                return Ok(None);
            }
            ch.region.take_message().map(Some)
        })
        .await
    }

    async fn send_reply(&mut self, payload: &[u8]) -> Result<()> {
        let payload = payload.to_vec();
        blocking(&self.channel, move |ch| {
            ch.region.put_message(&payload, false)?;
            ch.publish(Writer::Server)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        // Wake a client still waiting for a reply.
        self.channel.publish(Writer::ServerGone)?;
        self.unlink()
    }
}

impl Drop for ShmemServerTransport {
    fn drop(&mut self) {
        if let Err(e) = self.unlink() {
            warn!("Failed to remove shared objects: {}", e);
        }
    }
}

/// Client side: opens the objects the server created.
pub struct ShmemClientTransport {
    channel: Arc<ShmemChannel>,
    closed: bool,
}

impl ShmemClientTransport {
    pub fn open(config: &ShmemConfig) -> Result<Self> {
        let region = SharedRegion::open(&config.region_name)?;
        let data_ready = NamedSemaphore::open(&config.data_ready_name)?;
        let turn_order = NamedSemaphore::open(&config.turn_order_name)?;
        debug!("Opened shared segment {}", config.region_name);
        Ok(Self {
            channel: Arc::new(ShmemChannel {
                region,
                data_ready,
                turn_order,
            }),
            closed: false,
        })
    }

    fn terminate(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.region.put_message(&[TERMINATION_BYTE], false)?;
        self.channel.publish(Writer::Client)
    }
}

/// Wait for the server's answer; `PeerClosed` if it tore the session down.
fn await_server(ch: &ShmemChannel) -> Result<Vec<u8>> {
    match ch.acquire(Writer::Client)? {
        Writer::Server => ch.region.take_message(),
        Writer::ServerGone => Err(OffloadError::PeerClosed),
        other => Err(OffloadError::protocol(format!(
            "unexpected writer mark {:?}",
            other
        ))),
    }
}

#[async_trait::async_trait]
impl ClientTransport for ShmemClientTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::NativeBinary
    }

    async fn send_module(&mut self, module_text: &str) -> Result<ReadySignal> {
        let text = module_text.as_bytes().to_vec();
        let ready = blocking(&self.channel, move |ch| {
            ch.region.put_message(&text, true)?;
            ch.publish(Writer::Client)?;
            await_server(ch)
        })
        .await?;
        let ready: [u8; 16] = ready
            .as_slice()
            .try_into()
            .map_err(|_| OffloadError::protocol(format!("ready signal is {} bytes", ready.len())))?;
        Ok(ReadySignal::from_native(&ready))
    }

    async fn send_call(&mut self, payload: &[u8]) -> Result<()> {
        let payload = payload.to_vec();
        blocking(&self.channel, move |ch| {
            ch.region.put_message(&payload, false)?;
            ch.publish(Writer::Client)
        })
        .await
    }

    async fn receive_reply(&mut self) -> Result<Vec<u8>> {
        blocking(&self.channel, await_server).await
    }

    async fn close(&mut self) -> Result<()> {
        self.terminate()
    }
}

impl Drop for ShmemClientTransport {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Failed to end shared segment session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(tag: &str) -> ShmemConfig {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        ShmemConfig::with_base(&format!("offload_test_{}_{}_{}", tag, std::process::id(), n), 4096)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_call_and_termination() {
        let config = test_config("session");
        let mut server = ShmemServerTransport::create(config.clone()).unwrap();
        let mut client = ShmemClientTransport::open(&config).unwrap();

        let server_task = tokio::spawn(async move {
            let module = server.receive_module().await.unwrap().unwrap();
            assert_eq!(module, "5;32:add:5;32:5;32");
            server
                .send_ready(ReadySignal {
                    optimize_micros: 7,
                    init_micros: 3,
                })
                .await
                .unwrap();
            let call = server.receive_call().await.unwrap().unwrap();
            assert_eq!(call, b"add:\x03\x00\x00\x00\x04\x00\x00\x00");
            server.send_reply(b"reply").await.unwrap();
            assert!(server.receive_call().await.unwrap().is_none());
            server.close().await.unwrap();
        });

        let ready = client.send_module("5;32:add:5;32:5;32").await.unwrap();
        assert_eq!((ready.optimize_micros, ready.init_micros), (7, 3));
        client
            .send_call(b"add:\x03\x00\x00\x00\x04\x00\x00\x00")
            .await
            .unwrap();
        assert_eq!(client.receive_reply().await.unwrap(), b"reply");
        client.close().await.unwrap();

        server_task.await.unwrap();
        assert!(ShmemClientTransport::open(&config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_close_wakes_waiting_client() {
        let config = test_config("gone");
        let mut server = ShmemServerTransport::create(config.clone()).unwrap();
        let mut client = ShmemClientTransport::open(&config).unwrap();

        client.send_call(b"work").await.unwrap();
        assert_eq!(server.receive_call().await.unwrap().unwrap(), b"work");
        server.close().await.unwrap();

        assert!(matches!(
            client.receive_reply().await.unwrap_err(),
            OffloadError::PeerClosed
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let config = test_config("big");
        let _server = ShmemServerTransport::create(config.clone()).unwrap();
        let mut client = ShmemClientTransport::open(&config).unwrap();
        let err = client.send_call(&vec![1u8; 4096]).await.unwrap_err();
        assert!(matches!(err, OffloadError::MessageTooLarge { max: 4087, .. }));
    }

    #[tokio::test]
    async fn test_stale_objects_are_replaced() {
        let config = test_config("stale");
        let first = ShmemServerTransport::create(config.clone()).unwrap();
        // Simulate an unclean exit: the objects stay behind.
        std::mem::forget(first);
        let second = ShmemServerTransport::create(config.clone()).unwrap();
        assert_eq!(second.config(), &config);
    }

    #[test]
    fn test_open_without_server_fails() {
        let config = test_config("absent");
        assert!(matches!(
            ShmemClientTransport::open(&config).map(|_| ()).unwrap_err(),
            OffloadError::Transport { .. }
        ));
    }
}
