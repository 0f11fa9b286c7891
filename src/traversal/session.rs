//! STUN/TURN sessions over UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::stun::{
    verify_integrity, Attribute, Class, Message, Method, ALLOCATION_MISMATCH, TRANSPORT_UDP,
};
use crate::config::TurnConfig;
use crate::error::{with_timeout, Error, Result};

const ALLOCATION_LIFETIME_SECS: u32 = 600;
const MAX_DATAGRAM: usize = 1500;

/// Result of an allocate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOutcome {
    /// The server allocated a relay at this address.
    Allocated(SocketAddr),
    /// An allocation for this 5-tuple already exists. Counts as success.
    AlreadyAllocated,
}

/// An established conversation with one STUN/TURN server.
#[async_trait]
pub trait TraversalSession: Send + Sync + 'static {
    /// Server address the session talks to.
    fn server(&self) -> String;

    /// Ask for the server-reflexive address. Also serves as liveness probe.
    async fn binding(&self) -> Result<SocketAddr>;

    /// Request (or confirm) a UDP relay allocation.
    async fn allocate(&self) -> Result<AllocateOutcome>;

    /// Release the session.
    async fn close(&self) -> Result<()>;
}

/// Establishes sessions. Each call is one dial.
#[async_trait]
pub trait TraversalDialer: Send + Sync + 'static {
    /// Open a new session.
    async fn dial(&self) -> Result<Arc<dyn TraversalSession>>;
}

/// Dials the configured servers in order over UDP.
#[derive(Debug, Clone)]
pub struct UdpDialer {
    servers: Vec<String>,
    username: String,
    password: String,
    timeout: Duration,
}

impl UdpDialer {
    /// Dialer for the servers and credentials in `config`.
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            servers: config.server_addresses.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.request_timeout,
        }
    }

    async fn dial_one(&self, server: &str) -> Result<StunSession> {
        let target = tokio::net::lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| Error::network(format!("{server} did not resolve")))?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        let session = StunSession {
            socket,
            server: target,
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: self.timeout,
            transaction: Mutex::new(()),
        };
        // a dial only counts once the server answered
        session.binding().await?;
        Ok(session)
    }
}

#[async_trait]
impl TraversalDialer for UdpDialer {
    async fn dial(&self) -> Result<Arc<dyn TraversalSession>> {
        if self.servers.is_empty() {
            return Err(Error::config("no TURN server addresses configured"));
        }
        let mut last_err = None;
        for server in &self.servers {
            match self.dial_one(server).await {
                Ok(session) => {
                    debug!(%server, "traversal session established");
                    return Ok(Arc::new(session));
                }
                Err(e) => {
                    warn!(%server, error = %e, "traversal server unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::network("no traversal server reachable")))
    }
}

/// A session on a connected UDP socket. Transactions run one at a time.
pub struct StunSession {
    socket: UdpSocket,
    server: SocketAddr,
    username: String,
    password: String,
    timeout: Duration,
    transaction: Mutex<()>,
}

impl StunSession {
    async fn transact(&self, request: Message, authenticated: bool) -> Result<Message> {
        let _guard = self.transaction.lock().await;
        let key = authenticated.then_some(self.password.as_bytes());
        let bytes = request.encode(key);

        with_timeout("stun", self.timeout, async {
            self.socket.send(&bytes).await?;
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let n = self.socket.recv(&mut buf).await?;
                let response = match Message::decode(&buf[..n]) {
                    Ok(m) => m,
                    Err(e) => {
                        trace!(error = %e, "ignoring non-stun datagram");
                        continue;
                    }
                };
                if response.transaction_id != request.transaction_id {
                    trace!("ignoring response to another transaction");
                    continue;
                }
                if authenticated && response.class == Class::Success {
                    verify_integrity(&buf[..n], key.unwrap_or_default())?;
                }
                return Ok(response);
            }
        })
        .await
    }
}

#[async_trait]
impl TraversalSession for StunSession {
    fn server(&self) -> String {
        self.server.to_string()
    }

    async fn binding(&self) -> Result<SocketAddr> {
        let response = self.transact(Message::request(Method::Binding), false).await?;
        match response.class {
            Class::Success => response
                .mapped_address()
                .ok_or_else(|| Error::validation("binding response without mapped address")),
            _ => Err(error_response("binding", &response)),
        }
    }

    async fn allocate(&self) -> Result<AllocateOutcome> {
        let request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP))
            .with(Attribute::Lifetime(ALLOCATION_LIFETIME_SECS))
            .with(Attribute::Username(self.username.clone()));
        let response = self.transact(request, true).await?;
        match response.class {
            Class::Success => response
                .relayed_address()
                .map(AllocateOutcome::Allocated)
                .ok_or_else(|| Error::validation("allocate response without relayed address")),
            Class::Error if response.error_code().map(|(c, _)| c) == Some(ALLOCATION_MISMATCH) => {
                Ok(AllocateOutcome::AlreadyAllocated)
            }
            _ => Err(error_response("allocate", &response)),
        }
    }

    async fn close(&self) -> Result<()> {
        trace!(server = %self.server, "traversal session closed");
        Ok(())
    }
}

fn error_response(op: &str, response: &Message) -> Error {
    match response.error_code() {
        Some((code, reason)) => Error::network(format!("{op} failed: {code} {reason}")),
        None => Error::network(format!("{op} failed: unexpected {:?} response", response.class)),
    }
}
