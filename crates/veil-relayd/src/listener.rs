//! Inbound session acceptor.
//!
//! One listener per configured address. Every accepted connection runs on
//! its own task: wire handshake first, then the PKI incoming-authentication
//! policy. An invalid peer is torn down immediately; a valid peer's packets
//! are pushed onto the ingress queue iff the policy granted `can_send`,
//! and silently dropped otherwise.
//!
//! Providers additionally accept client sessions authenticated against the
//! user database instead of the consensus.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use veil_crypto::ed25519::SigningKey;
use veil_transport::quic::{LinkConfig, LinkNode};
use veil_transport::wire::{self, Hello};

use crate::packet::{Counters, IngressPacket};
use crate::pki::Pki;
use crate::provider::UserDb;
use crate::Result;

/// Shared dependencies for every listener.
#[derive(Clone)]
pub struct ListenerContext {
    pub pki: Arc<Pki>,
    pub ingress: mpsc::Sender<IngressPacket>,
    pub identity: Arc<SigningKey>,
    pub link_public: [u8; 32],
    pub counters: Arc<Counters>,
    pub is_provider: bool,
    pub user_db: Option<Arc<dyn UserDb>>,
}

/// Handle to one listener task.
pub struct Listener {
    link: Arc<LinkNode>,
    handle: Option<JoinHandle<()>>,
    halt_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the address and start accepting sessions.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the address cannot be bound; this is
    /// fatal at startup.
    pub fn spawn(id: usize, addr: SocketAddr, ctx: ListenerContext) -> Result<Self> {
        let link = Arc::new(LinkNode::new(LinkConfig {
            bind_addr: addr,
            ..LinkConfig::default()
        })?);
        let local_addr = link.local_addr();
        info!(listener = id, %local_addr, "listener online");

        let (halt_tx, halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(accept_loop(
            id,
            Arc::clone(&link),
            ctx,
            halt_tx.clone(),
            halt_rx,
        ));

        Ok(Self {
            link,
            handle: Some(handle),
            halt_tx,
            local_addr,
        })
    }

    /// The bound address (useful when the config named port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close all inbound sessions.
    pub async fn halt(&mut self) {
        let _ = self.halt_tx.send(());
        self.link.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    id: usize,
    link: Arc<LinkNode>,
    ctx: ListenerContext,
    halt_tx: broadcast::Sender<()>,
    mut halt_rx: broadcast::Receiver<()>,
) {
    loop {
        let incoming = tokio::select! {
            _ = halt_rx.recv() => {
                debug!(listener = id, "listener terminating");
                return;
            }
            incoming = link.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            // Endpoint closed.
            return;
        };

        let ctx = ctx.clone();
        let session_halt = halt_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = inbound_session(incoming, ctx, session_halt).await {
                debug!("inbound session ended: {e}");
            }
        });
    }
}

async fn inbound_session(
    incoming: quinn::Incoming,
    ctx: ListenerContext,
    mut halt_rx: broadcast::Receiver<()>,
) -> std::result::Result<(), veil_transport::TransportError> {
    let conn = incoming
        .await
        .map_err(|e| veil_transport::TransportError::Connection(e.to_string()))?;
    let remote = conn.remote_address();

    let (mut send_stream, mut recv_stream) = tokio::select! {
        _ = halt_rx.recv() => return Ok(()),
        result = LinkNode::accept_bi(&conn) => result?,
    };

    // The dialer speaks first.
    let creds = tokio::select! {
        _ = halt_rx.recv() => return Ok(()),
        result = wire::recv_hello(&mut recv_stream) => result?,
    };

    let (mut can_send, is_valid) = ctx.pki.authenticate_incoming(&creds);
    let mut accepted = is_valid;
    if !accepted && ctx.is_provider {
        // Not a relay we know; maybe one of our users.
        if let Some(user_db) = &ctx.user_db {
            if user_db.is_valid(&creds.additional_data, &creds.public_key) {
                debug!(%remote, "accepted client session");
                accepted = true;
                can_send = true;
            }
        }
    }
    if !accepted {
        debug!(%remote, "peer failed authentication, closing");
        return Ok(());
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let hello = Hello::new(&ctx.identity, ctx.link_public, timestamp);
    wire::send_hello(&mut send_stream, &hello).await?;

    debug!(%remote, can_send, "inbound session authenticated");

    loop {
        let packet = tokio::select! {
            _ = halt_rx.recv() => return Ok(()),
            result = wire::recv_packet(&mut recv_stream) => result?,
        };

        if !can_send {
            // Valid peer outside its send window; packets are dropped
            // without feedback.
            continue;
        }

        let ingress_packet = IngressPacket {
            arrival: Instant::now(),
            payload: packet,
        };
        if ctx.ingress.try_send(ingress_packet).is_err() {
            Counters::incr(&ctx.counters.ingress_shed);
            debug!(%remote, "ingress queue full, shedding packet");
        }
    }
}
