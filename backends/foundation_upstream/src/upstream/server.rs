//! The fake upstream server and its event loop thread.
//!
//! WHY: Client tests need a real peer on a real socket that they can script
//! step by step, without racing the thread doing the socket I/O.
//!
//! WHAT: [`FakeUpstream`] binds a listener, runs a [`Dispatcher`] on its own
//! thread, and queues every accepted connection until a test claims it as a
//! [`FakeHttpConnection`] or [`FakeRawConnection`].
//!
//! HOW: The loop thread is the only one that touches connections. Tests block
//! on [`WaitableState`] predicates and reach connections by posting tasks.

use std::collections::VecDeque;
use std::panic;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::base::FakeConnectionBase;
use super::http::FakeHttpConnection;
use super::pump;
use super::queued::{AcceptQueue, QueuedConnection};
use super::raw::FakeRawConnection;
use crate::config::{HttpType, IpVersion, ListenEndpoint, UpstreamConfig};
use crate::errors::{UpstreamError, UpstreamResult};
use crate::netloop::{
    Connection, Dispatcher, DispatcherHandle, FilterChainFactory, Listener, RunType,
};
use crate::stats::{IsolatedStats, CX_ACCEPTED, CX_CLAIMED_HTTP, CX_CLAIMED_RAW};
use crate::synca::WaitableState;

/// Queues every accepted connection. Never rejects.
struct QueueingFilterChain {
    queue: Arc<AcceptQueue>,
    stats: IsolatedStats,
}

impl FilterChainFactory for QueueingFilterChain {
    fn create_filter_chain(&mut self, connection: &mut Connection) -> bool {
        self.stats.inc(CX_ACCEPTED);
        let queued = QueuedConnection::new(connection, &self.queue);

        tracing::debug!("queued accepted connection {}", connection.id());
        self.queue.update(|queue| queue.push_back(queued));
        true
    }
}

/// A programmable upstream server for client tests.
///
/// Dropping it stops the event loop and joins its thread. Connections still
/// open at that point are closed by the loop's shutdown. A harness failure that
/// panicked the loop thread is re-raised on the dropping thread.
#[derive(Debug)]
pub struct FakeUpstream {
    http_type: HttpType,
    local_address: ListenEndpoint,
    queue: Arc<AcceptQueue>,
    stats: IsolatedStats,
    dispatcher: DispatcherHandle,
    thread: Option<JoinHandle<()>>,
}

impl FakeUpstream {
    /// Binds and starts serving. Returns once the loop thread is running.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Bind`] when the endpoint cannot be bound, and
    /// [`UpstreamError::InitializationTimeout`] when the loop thread does not
    /// come up within the configured init timeout.
    pub fn new(config: UpstreamConfig) -> UpstreamResult<Self> {
        let listener = Listener::bind(config.get_endpoint()).map_err(UpstreamError::Bind)?;
        #[cfg(feature = "ssl-rustls")]
        let listener = listener.with_tls(config.get_tls());
        let local_address = listener.local_endpoint().clone();

        let queue: Arc<AcceptQueue> = Arc::new(WaitableState::new(VecDeque::new()));
        let stats = IsolatedStats::new();

        let mut dispatcher = Dispatcher::new()?;
        dispatcher.add_listener(
            listener,
            Box::new(QueueingFilterChain {
                queue: Arc::clone(&queue),
                stats: stats.clone(),
            }),
        )?;
        let handle = dispatcher.handle();

        let initialized = Arc::new(WaitableState::new(false));
        let ready = Arc::clone(&initialized);
        let thread = thread::Builder::new()
            .name(format!("fake-upstream-{}", local_address.port().unwrap_or(0)))
            .spawn(move || {
                ready.update(|running| *running = true);

                if let Err(err) = dispatcher.run(RunType::Block) {
                    tracing::error!("fake upstream event loop failed: {err}");
                }
                dispatcher.shutdown();
            })
            .map_err(|err| {
                tracing::error!("could not spawn fake upstream thread: {err}");
                UpstreamError::LoopThreadSpawn
            })?;

        let upstream = Self {
            http_type: config.get_http_type(),
            local_address,
            queue,
            stats,
            dispatcher: handle,
            thread: Some(thread),
        };

        if !initialized.wait_until(config.get_init_timeout(), |running| *running) {
            return Err(UpstreamError::InitializationTimeout);
        }

        tracing::info!(
            "fake upstream listening on {} ({:?})",
            upstream.local_address,
            upstream.http_type
        );
        Ok(upstream)
    }

    /// Plaintext loopback TCP upstream. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn bind_tcp(port: u16, http_type: HttpType, version: IpVersion) -> UpstreamResult<Self> {
        Self::new(UpstreamConfig::tcp(port, version).http_type(http_type))
    }

    /// Upstream listening on a Unix domain socket at `path`.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    #[cfg(unix)]
    pub fn bind_unix(path: impl Into<PathBuf>, http_type: HttpType) -> UpstreamResult<Self> {
        Self::new(UpstreamConfig::unix(path).http_type(http_type))
    }

    /// IPv4 loopback upstream terminating TLS with `tls`.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    #[cfg(feature = "ssl-rustls")]
    pub fn bind_tls(
        tls: Arc<rustls::ServerConfig>,
        port: u16,
        http_type: HttpType,
    ) -> UpstreamResult<Self> {
        Self::new(
            UpstreamConfig::tcp(port, IpVersion::V4)
                .http_type(http_type)
                .tls(tls),
        )
    }

    #[must_use]
    pub fn http_type(&self) -> HttpType {
        self.http_type
    }

    /// The bound endpoint, with the real port when bound to port 0.
    #[must_use]
    pub fn local_address(&self) -> &ListenEndpoint {
        &self.local_address
    }

    #[must_use]
    pub fn stats(&self) -> &IsolatedStats {
        &self.stats
    }

    /// Whether the loop thread is still alive. It only stops early when a
    /// harness failure panicked it.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Claims the oldest accepted connection as an HTTP connection, waiting
    /// for one if needed and turning `client` meanwhile.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if no connection was accepted in time.
    pub fn wait_for_http_connection(
        &self,
        client: &mut Dispatcher,
        timeout: Duration,
    ) -> UpstreamResult<FakeHttpConnection> {
        let base = self
            .queue
            .wait_pumping_then(
                timeout,
                || pump(client),
                |queue| !queue.is_empty(),
                |queue| queue.pop_front().map(FakeConnectionBase::new),
            )
            .flatten()
            .ok_or_else(|| UpstreamError::timeout("http connection", timeout))?;

        self.stats.inc(CX_CLAIMED_HTTP);
        tracing::debug!("claimed connection {} as http", base.connection().id());
        Ok(FakeHttpConnection::new(
            base,
            self.stats.clone(),
            self.http_type,
        ))
    }

    /// Claims the oldest accepted connection as a raw byte connection.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if no connection was accepted in time.
    pub fn wait_for_raw_connection(&self, timeout: Duration) -> UpstreamResult<FakeRawConnection> {
        let base = self
            .queue
            .wait_then(
                timeout,
                |queue| !queue.is_empty(),
                |queue| queue.pop_front().map(FakeConnectionBase::new),
            )
            .flatten()
            .ok_or_else(|| UpstreamError::timeout("raw connection", timeout))?;

        self.stats.inc(CX_CLAIMED_RAW);
        tracing::debug!("claimed connection {} as raw", base.connection().id());
        Ok(FakeRawConnection::new(base))
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        let queue = Arc::clone(&self.queue);
        self.dispatcher.post(move |dispatcher| {
            // shutdown closes these, which must not count as unclaimed drops
            let released = queue.update(|queue| {
                for queued in queue.iter() {
                    queued.mark_parented();
                }
                queue.len()
            });
            if released > 0 {
                tracing::warn!("tearing down with {released} connection(s) no test claimed");
            }
            dispatcher.exit();
        });

        let Some(thread) = self.thread.take() else {
            return;
        };

        match thread.join() {
            Ok(()) => tracing::debug!("fake upstream on {} stopped", self.local_address),
            Err(payload) if thread::panicking() => {
                tracing::error!(
                    "fake upstream loop panicked while the test was already failing: {:?}",
                    payload.downcast_ref::<String>()
                );
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
