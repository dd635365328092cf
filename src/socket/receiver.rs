use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Reads from a socket shared with the send loop
pub struct SocketReceiver {
    socket: Arc<TcpStream>,
}

impl SocketReceiver {
    pub fn new(socket: Arc<TcpStream>) -> SocketReceiver {
        SocketReceiver { socket }
    }

    /// Wait until the socket is readable without reading. Callers use this to avoid holding
    ///  pipe memory for connections that are idle most of the time.
    pub async fn wait_for_data(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    /// receive into `buf`, returning 0 if the peer closed the connection
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.socket.readable().await?;
            match self.socket.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
