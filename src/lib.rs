//! vmeirqd: a daemon that multiplexes VME crate interrupt events across
//! local client processes.
//!
//! The daemon owns a small set of VME crates' interrupt hardware and
//! dispatches events to whichever client registered interest in them,
//! speaking a fixed-frame request/response protocol over a local
//! sequenced-packet socket. See the individual modules for the pieces:
//! selector bit-packing ([`selector`]), the subscription table
//! ([`table`]), the wire codec ([`codec`]), the crate hardware boundary
//! ([`hardware`]), the socket surface ([`socket`]), signal handling
//! ([`signals`]), and the event loop itself ([`dispatcher`]).

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod options;
pub mod selector;
pub mod signals;
pub mod socket;
pub mod status;
pub mod table;

pub use error::{Error, ErrorKind, Result};
pub use selector::Selector;
