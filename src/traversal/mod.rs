//! NAT traversal through a STUN/TURN server.
//!
//! [`TraversalRefresher`] keeps a relay allocation and the server-reflexive
//! address current. It goes through a [`TraversalClient`], which probes its
//! session before handing it out and re-dials once when the probe fails.

pub(crate) mod client;
mod refresher;
mod session;
pub mod stun;

pub use client::{TraversalClient, TraversalState};
pub use refresher::{TraversalAddresses, TraversalRefresher};
pub use session::{AllocateOutcome, StunSession, TraversalDialer, TraversalSession, UdpDialer};
