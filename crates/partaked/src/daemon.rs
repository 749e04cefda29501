//! Daemon wiring and lifecycle.
//!
//! Binds the listening socket, owns the broker behind an `Rc<RefCell<..>>`,
//! and runs the accept loop, the voucher expiration timer, and the signal
//! wait on one current-thread runtime (`LocalSet`). Quit sequence: stop
//! accepting, drop every session's pending requests so nothing resumes into
//! teardown, destroy the sessions, then drain the voucher queue.

use crate::arena::ShmemAllocator;
use crate::broker::Broker;
use crate::connection;
use crate::segment::{page_size, Segment, SegmentConfig, SegmentError};
use crate::voucher_queue::{TimerHandle, EXPIRATION_BATCH_DELAY};
use log::{error, info, warn};
use partake_proto::KeySequence;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub segment: SegmentConfig,
    /// Power-of-two exponent; defaults to the page size when absent.
    pub granularity_log2: Option<u32>,
    pub voucher_ttl: Duration,
    /// Also unlinks a pre-existing socket path before binding.
    pub force: bool,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to create shared memory segment: {0}")]
    Segment(#[from] SegmentError),
    #[error("failed to listen on socket {path}: {source}", path = .path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    Signals(std::io::Error),
}

/// Removes the socket path when the daemon exits.
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            warn!("failed to unlink socket {}: {err}", self.0.display());
        } else {
            info!("closed listening socket: {}", self.0.display());
        }
    }
}

/// A bound, not-yet-running daemon. Separate from [`Daemon::run`] so tests
/// can connect clients and trigger quit without sending signals.
pub struct Daemon {
    listener: UnixListener,
    broker: Rc<RefCell<Broker>>,
    timer: TimerHandle,
    quit: Rc<Notify>,
    _segment: Segment,
    _socket_guard: SocketGuard,
}

/// Cloneable trigger for the quit sequence.
#[derive(Clone)]
pub struct QuitHandle {
    quit: Rc<Notify>,
}

impl QuitHandle {
    pub fn quit(&self) {
        self.quit.notify_one();
    }
}

impl Daemon {
    /// Creates the segment, sets up the allocator and broker, and binds the
    /// socket. Failures here are the only ones that fail the whole process.
    pub fn bind(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let segment = Segment::create(&config.segment)?;

        let granularity_log2 = config
            .granularity_log2
            .unwrap_or_else(|| page_size().trailing_zeros());
        let granularity = 1usize << granularity_log2;
        info!("allocation granularity set to {}", human_size(granularity));
        if segment.size() % granularity != 0 {
            warn!(
                "segment size is not a multiple of the allocation granularity; wasting {} bytes",
                segment.size() % granularity
            );
        }
        let allocator = ShmemAllocator::new(segment.size(), granularity_log2);

        let timer = TimerHandle::new();
        let broker = Broker::new(
            allocator,
            segment.spec(),
            config.voucher_ttl,
            KeySequence::with_seed(rand::random()),
            timer.clone(),
        );

        if config.force {
            let _ = std::fs::remove_file(&config.socket_path);
        }
        let listener = UnixListener::bind(&config.socket_path).map_err(|source| {
            DaemonError::Bind {
                path: config.socket_path.clone(),
                source,
            }
        })?;
        info!("listening on socket: {}", config.socket_path.display());

        Ok(Self {
            listener,
            broker: Rc::new(RefCell::new(broker)),
            timer,
            quit: Rc::new(Notify::new()),
            _segment: segment,
            _socket_guard: SocketGuard(config.socket_path.clone()),
        })
    }

    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            quit: Rc::clone(&self.quit),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self._socket_guard.0
    }

    /// Accepts and serves connections until quit. Must run inside a
    /// `LocalSet` on a current-thread runtime.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();
        tasks.spawn_local(expiration_timer(Rc::clone(&self.broker), self.timer.clone()));

        loop {
            tokio::select! {
                () = self.quit.notified() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                            let sid = self.broker.borrow_mut().add_session(tx);
                            info!("client {sid}: connected");
                            tasks.spawn_local(connection::serve(
                                stream,
                                Rc::clone(&self.broker),
                                sid,
                                rx,
                            ));
                        }
                        Err(err) => {
                            error!("failed to accept connection: {err}");
                        }
                    }
                }
            }
        }

        info!("quitting");
        drop(self.listener);
        self.broker.borrow_mut().shutdown();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// [`Self::run`] plus the signal wait that triggers quit.
    pub async fn run_with_signals(self) -> Result<(), DaemonError> {
        let quit = self.quit_handle();
        let signals = tokio::task::spawn_local(async move {
            match wait_for_quit_signal().await {
                Ok(signal) => info!("signal {signal} received"),
                Err(err) => error!("signal wait failed: {err}"),
            }
            quit.quit();
        });
        self.run().await;
        signals.abort();
        Ok(())
    }
}

async fn wait_for_quit_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = hangup.recv() => "SIGHUP",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}

/// Voucher expiration timer task.
///
/// Sleeps until the earliest queued expiration plus the batching delay, then
/// drops everything expired and rearms. The [`TimerHandle`] wakes it early
/// when a voucher with an earlier expiration is enqueued; dropped vouchers
/// never reschedule, so a wake-up can find nothing to do.
async fn expiration_timer(broker: Rc<RefCell<Broker>>, timer: TimerHandle) {
    loop {
        let earliest = broker.borrow().earliest_expiration();
        match earliest {
            None => {
                timer.set_scheduled(None);
                timer.notified().await;
            }
            Some(expiration) => {
                timer.set_scheduled(Some(expiration));
                let deadline = tokio::time::Instant::from_std(expiration + EXPIRATION_BATCH_DELAY);
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        timer.set_scheduled(None);
                        broker.borrow_mut().expire_vouchers(Instant::now());
                    }
                    () = timer.notified() => {
                        // Recompute the earliest expiration and rearm.
                        timer.set_scheduled(None);
                    }
                }
            }
        }
    }
}

fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["bytes", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} bytes")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
