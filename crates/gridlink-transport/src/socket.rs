//! TCP dialing with configured socket options

use crate::error::{TransportError, TransportResult};
use gridlink_core::{Address, ClientNetworkConfig, SocketOptions};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opens TCP sockets to resolved addresses
#[derive(Debug, Clone)]
pub struct SocketConnector {
    options: SocketOptions,
}

impl SocketConnector {
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &ClientNetworkConfig) -> Self {
        Self::new(config.socket.clone())
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Dial `address`, bounded by the connect timeout and `cancel`
    ///
    /// On failure the socket is dropped; nothing is left half-open.
    pub async fn connect(
        &self,
        address: &Address,
        cancel: &CancellationToken,
    ) -> TransportResult<TcpStream> {
        let endpoint = address.socket_addr();
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket.set_keepalive(self.options.keep_alive)?;
        if self.options.buffer_size > 0 {
            socket.set_send_buffer_size(self.options.buffer_size)?;
            socket.set_recv_buffer_size(self.options.buffer_size)?;
        }

        debug!("Connecting to {} ({})", address, address.host());

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.options.connect_timeout, socket.connect(endpoint)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        return Err(TransportError::ConnectionFailed {
                            address: address.to_string(),
                            source: e,
                        })
                    }
                    Err(_) => return Err(TransportError::Timeout(address.to_string())),
                }
            }
        };

        stream.set_nodelay(self.options.no_delay)?;
        if let Some(linger) = self.options.linger {
            stream.set_linger(Some(linger))?;
        }

        debug!(
            "Connected to {} from {:?}",
            address,
            stream.local_addr().ok()
        );
        Ok(stream)
    }
}
