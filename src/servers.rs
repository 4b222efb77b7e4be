//! Server module
//!
//! Accept loops exposing the controller to network clients.

use std::net::SocketAddr;

use futures::Future;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::controller::ControllerHandle;

pub mod json;

/// A running server. The listener is shut down when this handle is dropped.
#[derive(Debug)]
pub struct ServerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    join_handle: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        debug!(server = %self.name, "stopping server");
        self.join_handle.abort();
    }
}

/// Listen on `address` and spawn `handle_client` for every accepted connection
///
/// # Parameters
///
/// * `name`: server name, for log messages
/// * `address`: address to bind to
/// * `controller`: controller handle passed to client handlers
/// * `handle_client`: connection handler
pub async fn bind<T, F, E>(
    name: &'static str,
    address: SocketAddr,
    controller: ControllerHandle,
    handle_client: T,
) -> std::io::Result<ServerHandle>
where
    T: Fn((TcpStream, SocketAddr), ControllerHandle) -> F + Send + 'static,
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;

    info!(server = %name, address = %local_addr, "server listening");

    let join_handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let client = handle_client((socket, peer_addr), controller.clone());

                    tokio::spawn(async move {
                        match client.await {
                            Ok(()) => {
                                debug!(server = %name, peer = %peer_addr, "client disconnected");
                            }
                            Err(error) => {
                                warn!(server = %name, peer = %peer_addr, error = %error, "client error");
                            }
                        }
                    });
                }
                Err(error) => {
                    warn!(server = %name, error = %error, "accept failed");
                }
            }
        }
    });

    Ok(ServerHandle {
        name,
        local_addr,
        join_handle,
    })
}
