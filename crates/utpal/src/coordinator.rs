//! Bridges application-level content requests to transport lifecycles.
//!
//! The surrounding protocol layer negotiates *what* moves and under which
//! connection id; this module turns those outcomes into sockets and
//! resolves them to bytes, writing fetched content through to the
//! content store.

use crate::error::Result;
use crate::transport::{Transfer, UtpHandle};
use bytes::Bytes;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;

/// Identifier of the sub-protocol a content item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u16);

/// Opaque content database the coordinator writes through to.
pub trait ContentStore: Send + Sync {
    fn put(&self, network: NetworkId, key: &[u8], value: Bytes);
    fn get(&self, network: NetworkId, key: &[u8]) -> Option<Bytes>;
}

/// Outcome of an application-level find-content request against a peer.
#[derive(Debug, Clone)]
pub enum ContentResponse {
    /// The content fit inline in the response itself.
    Content(Bytes),
    /// The peer set up a transfer under this connection id.
    ConnectionId(u16),
}

/// Maps content requests and offers onto transport transfers.
pub struct ContentCoordinator<S> {
    utp: UtpHandle,
    store: Arc<S>,
    network: NetworkId,
}

impl<S: ContentStore> ContentCoordinator<S> {
    pub fn new(utp: UtpHandle, store: Arc<S>, network: NetworkId) -> Self {
        Self { utp, store, network }
    }

    pub fn handle(&self) -> &UtpHandle {
        &self.utp
    }

    /// Resolves a find-content outcome to bytes, pulling over the
    /// transport when the peer handed off a connection id. Delivered
    /// content is written through to the store; an aborted or idle
    /// transfer yields empty bytes and stores nothing.
    pub async fn fetch(
        &self,
        remote: SocketAddr,
        content_key: &[u8],
        response: ContentResponse,
    ) -> Result<Bytes> {
        let content = match response {
            ContentResponse::Content(content) => content,
            ContentResponse::ConnectionId(conn_id) => {
                debug!("fetching from {remote} over connection {conn_id}");
                self.utp.read(remote, conn_id).await?
            }
        };
        if content.is_empty() {
            return Ok(content);
        }
        self.store.put(self.network, content_key, content.clone());
        Ok(content)
    }

    /// Serving side of a find-content handoff: opens a writer and returns
    /// the connection id to advertise together with the completion handle.
    pub async fn handoff(&self, remote: SocketAddr, payload: Bytes) -> Result<(u16, Transfer)> {
        self.utp.create_writer(remote, payload).await
    }

    /// Streams accepted offer content over the negotiated id; resolves
    /// when the closing FIN is acknowledged.
    pub async fn serve(&self, remote: SocketAddr, conn_id: u16, payload: Bytes) -> Result<()> {
        let transfer = self.utp.create_writer_on(remote, conn_id, payload).await?;
        transfer.wait().await
    }

    /// Abandons a pending transfer; its promise resolves with `Cancelled`.
    pub fn cancel(&self, remote: SocketAddr, conn_id: u16) {
        self.utp.cancel(remote, conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Outbound, UtpTransport};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<(u16, Vec<u8>), Bytes>>,
    }

    impl ContentStore for MemoryStore {
        fn put(&self, network: NetworkId, key: &[u8], value: Bytes) {
            self.entries
                .lock()
                .unwrap()
                .insert((network.0, key.to_vec()), value);
        }

        fn get(&self, network: NetworkId, key: &[u8]) -> Option<Bytes> {
            self.entries
                .lock()
                .unwrap()
                .get(&(network.0, key.to_vec()))
                .cloned()
        }
    }

    fn node() -> (UtpHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (transport, handle) = UtpTransport::new(out_tx);
        tokio::spawn(transport.run());
        (handle, out_rx)
    }

    fn link(
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        peer: UtpHandle,
        from: SocketAddr,
    ) {
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                peer.on_datagram(from, out.payload);
            }
        });
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn coordinator(handle: UtpHandle) -> (ContentCoordinator<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        (
            ContentCoordinator::new(handle, store.clone(), NetworkId(1)),
            store,
        )
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_inline_response_is_stored_and_returned() {
        let (handle, _out) = node();
        let (coordinator, store) = coordinator(handle);

        let content = Bytes::from_static(b"block body");
        let got = coordinator
            .fetch(addr(9000), b"key-1", ContentResponse::Content(content.clone()))
            .await
            .unwrap();

        assert_eq!(got, content);
        assert_eq!(store.get(NetworkId(1), b"key-1"), Some(content));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_handoff_response_pulls_over_transport() {
        let (a, a_out) = node();
        let (b, b_out) = node();
        let (addr_a, addr_b) = (addr(9001), addr(9002));
        link(a_out, b.clone(), addr_a);
        link(b_out, a.clone(), addr_b);

        let (server, _server_store) = coordinator(a);
        let (client, client_store) = coordinator(b);

        let content = Bytes::from(vec![7u8; 5000]);
        let (conn_id, transfer) = server.handoff(addr_b, content.clone()).await.unwrap();

        let fetch = client.fetch(addr_a, b"key-2", ContentResponse::ConnectionId(conn_id));
        let (got, sent) = tokio::join!(fetch, transfer.wait());
        assert_eq!(got.unwrap(), content);
        sent.unwrap();

        // Write-through happened on assembly completion.
        assert_eq!(client_store.get(NetworkId(1), b"key-2"), Some(content));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_serve_streams_negotiated_offer() {
        let (a, a_out) = node();
        let (b, b_out) = node();
        let (addr_a, addr_b) = (addr(9003), addr(9004));
        link(a_out, b.clone(), addr_a);
        link(b_out, a.clone(), addr_b);

        let (offerer, _) = coordinator(a);
        let (acceptor, acceptor_store) = coordinator(b);

        // The accepting side picked the id in its accept message.
        let conn_id = 4242;
        let content = Bytes::from(vec![3u8; 40_000]);

        let pull = acceptor.fetch(addr_a, b"key-3", ContentResponse::ConnectionId(conn_id));
        let push = offerer.serve(addr_b, conn_id, content.clone());

        let (got, sent) = tokio::join!(pull, push);
        assert_eq!(got.unwrap(), content);
        sent.unwrap();
        assert_eq!(acceptor_store.get(NetworkId(1), b"key-3"), Some(content));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_dead_peer_fetch_resolves_empty_and_stores_nothing() {
        let (handle, _out) = node();
        let (coordinator, store) = coordinator(handle);

        let got = coordinator
            .fetch(addr(9005), b"key-4", ContentResponse::ConnectionId(555))
            .await
            .unwrap();
        assert!(got.is_empty());
        assert_eq!(store.get(NetworkId(1), b"key-4"), None);
    }
}
