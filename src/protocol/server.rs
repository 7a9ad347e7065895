use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
};

use log::{info, warn};

use crate::message::AnyMessage;

use super::{Connection, QueryResponder, ThreadPool, transport::TransportError};

/// Accepts requester connections and serves their queries on a worker pool.
pub struct QueryServer {
    listener: TcpListener,
    responder: Arc<QueryResponder>,
    pool: ThreadPool,
    window_size: usize,
}

impl QueryServer {
    pub fn bind(
        address: SocketAddr,
        responder: QueryResponder,
        workers: usize,
        window_size: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            responder: Arc::new(responder),
            pool: ThreadPool::new(workers),
            window_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn listen(self) -> Result<(), TransportError> {
        info!(
            "listening at {} with {} workers",
            self.local_addr()?,
            self.pool.size()
        );

        for (peer, stream) in (1_u64..).zip(self.listener.incoming()) {
            match stream {
                Ok(stream) => {
                    let responder = Arc::clone(&self.responder);
                    let window_size = self.window_size;
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, peer, &responder, window_size) {
                            warn!("peer {peer}: connection dropped: {e}");
                        }
                        responder.active().close_peer(peer);
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    peer: u64,
    responder: &QueryResponder,
    window_size: usize,
) -> Result<(), TransportError> {
    info!("peer {peer} connected from {}", stream.peer_addr()?);
    let mut connection = Connection::with_window(stream, window_size);

    loop {
        match connection.read_message()? {
            Some(AnyMessage::QueryRequest(request)) => {
                match responder.handle(peer, request, &mut connection) {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!("peer {peer}: {e}"),
                    Ok(()) => {}
                }
            }
            Some(other) => warn!("peer {peer}: ignoring {:?}", other.message_type()),
            None => {
                info!("peer {peer} disconnected");
                return Ok(());
            }
        }
    }
}
