//! The partake daemon.
//!
//! Partake brokers access to a single large shared-memory segment among
//! multiple local client processes connected over a Unix-domain stream
//! socket. Clients ask the daemon to allocate chunks inside the segment,
//! obtain opaque keys naming those chunks, and memory-map the segment
//! themselves to read or write the data. The daemon never touches the
//! segment contents; it only arbitrates ownership, visibility, and lifetime
//! of chunks so that producers and consumers can exchange large binary
//! payloads without copying.
//!
//! Crate layout, leaves first:
//!
//! - [`arena`]: block allocator over the segment (next-fit, power-of-two
//!   free lists, eager coalescing), plus the byte-granularity wrapper.
//! - [`segment`]: creation and publication of the shared-memory segment.
//! - [`object`]: proper objects and vouchers.
//! - [`voucher_queue`]: voucher expiration queue and timer scheduling.
//! - [`repository`]: process-wide registry mapping tokens to objects.
//! - [`session`] and [`broker`]: the share/unshare/wait state machine.
//! - [`connection`]: framing pump and request dispatch for one client.
//! - [`daemon`]: acceptor, lifecycle, quit.
//! - [`cli`]: command line surface.
//!
//! The wire-level types live in the `partake-proto` crate.

pub mod arena;
pub mod broker;
pub mod cli;
pub mod connection;
pub mod daemon;
mod invariants;
pub mod object;
pub mod repository;
pub mod segment;
pub mod session;
pub mod voucher_queue;

pub use broker::Broker;
pub use daemon::{Daemon, DaemonConfig, DaemonError};
