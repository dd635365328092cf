use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::select;
use tracing::{debug, error, trace, Instrument, Span};
use crate::error::ShutdownReason;
use crate::io_queue::IoQueueSettings;
use crate::pipe::{DuplexPipe, PipeReader, PipeWriter};
use crate::socket::receiver::SocketReceiver;
use crate::socket::sender::SenderPool;
use crate::socket::{ErrorClass, Transport, TransportCore, MIN_ALLOC_BUFFER_SIZE};

/// A transport working directly on a TCP socket, with zero-copy handover of received data to the
///  input pipe and vectored writes from the output pipe.
pub struct SocketTransport {
    core: TransportCore,
    socket: Arc<TcpStream>,
    /// close with RST instead of FIN if the connection ends with an error
    fin_on_error: bool,
}

impl SocketTransport {
    /// Spawn the receive and send loops on the I/O queue's scheduler, returning the transport and
    ///  the application's end of the pipes.
    pub fn start(
        socket: TcpStream,
        settings: &IoQueueSettings,
        wait_for_data: bool,
        fin_on_error: bool,
    ) -> io::Result<(Arc<SocketTransport>, DuplexPipe)> {
        let peer_addr = socket.peer_addr()?;
        let (transport_pipe, application_pipe) = DuplexPipe::pair(&settings.block_pool, settings.input_options, settings.output_options);
        let DuplexPipe { input: output_reader, output: input_writer } = transport_pipe;

        let transport = Arc::new(SocketTransport {
            core: TransportCore::new(peer_addr, input_writer.control(), output_reader.control()),
            socket: Arc::new(socket),
            fin_on_error,
        });

        let receive_task = settings.scheduler.spawn(
            transport.clone().do_receive(input_writer, wait_for_data)
                .instrument(Span::current())
        );
        let send_task = settings.scheduler.spawn(
            transport.clone().do_send(output_reader, settings.sender_pool.clone())
                .instrument(Span::current())
        );
        transport.core.set_tasks(receive_task, send_task);

        Ok((transport, application_pipe))
    }

    async fn do_receive(self: Arc<Self>, mut input: PipeWriter, wait_for_data: bool) {
        let receiver = SocketReceiver::new(self.socket.clone());

        let result = select! {
            r = Self::receive_loop(&receiver, &mut input, wait_for_data) => r,
            _ = self.core.shutdown_token().cancelled() => Ok(false),
        };

        match result {
            Ok(true) => {
                debug!("connection closed by peer {:?}", self.core.peer_addr());
                self.core.record_reason(ShutdownReason::PeerClosed);
            }
            Ok(false) => {}
            Err(e) => self.record_io_error(e, "receiving"),
        }
        input.complete();
    }

    /// returns `true` if the peer closed the connection, `false` if the input pipe's reader
    ///  stopped consuming
    async fn receive_loop(receiver: &SocketReceiver, input: &mut PipeWriter, wait_for_data: bool) -> io::Result<bool> {
        loop {
            if wait_for_data {
                receiver.wait_for_data().await?;
            }

            let memory = input.get_memory(MIN_ALLOC_BUFFER_SIZE);
            let num_read = receiver.receive(memory).await?;
            if num_read == 0 {
                return Ok(true);
            }
            trace!("received {} bytes", num_read);
            input.advance(num_read);

            let flush_result = input.flush().await;
            if flush_result.is_completed || flush_result.is_canceled {
                return Ok(false);
            }
        }
    }

    async fn do_send(self: Arc<Self>, mut output: PipeReader, sender_pool: Arc<SenderPool>) {
        let result = self.send_loop(&sender_pool, &mut output).await;
        output.complete();

        if let Err(e) = result {
            self.record_io_error(e, "sending");
        }
        self.shutdown(ShutdownReason::SendLoopCompleted);
    }

    /// A sender is rented per available buffer and returned after sending it, so idle
    ///  connections do not hold on to one
    async fn send_loop(&self, sender_pool: &SenderPool, output: &mut PipeReader) -> io::Result<()> {
        loop {
            let read_result = select! {
                r = output.read() => r,
                _ = self.core.shutdown_token().cancelled() => return Ok(()),
            };
            if read_result.is_canceled {
                return Ok(());
            }

            let buffer = read_result.buffer;
            if !buffer.is_empty() {
                let mut sender = sender_pool.rent();
                let sent = select! {
                    r = sender.send(&self.socket, &buffer) => Some(r),
                    _ = self.core.shutdown_token().cancelled() => None,
                };
                sender_pool.return_to_pool(sender);

                match sent {
                    Some(r) => r?,
                    None => return Ok(()),
                }
                output.advance(buffer.len());
            }

            if read_result.is_completed {
                return Ok(());
            }
        }
    }

    fn record_io_error(&self, e: io::Error, activity: &str) {
        match ErrorClass::classify(&e) {
            ErrorClass::Graceful => debug!("connection to {:?} reset while {}: {}", self.core.peer_addr(), activity, e),
            ErrorClass::Aborted => debug!("{} from {:?} aborted: {}", activity, self.core.peer_addr(), e),
            ErrorClass::Unexpected => error!("unexpected error {} {:?}: {}", activity, self.core.peer_addr(), e),
        }
        self.core.record_reason(ErrorClass::shutdown_reason(&e));
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.core.peer_addr()
    }

    fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.core.shutdown_reason()
    }

    fn record_reason(&self, reason: ShutdownReason) {
        self.core.record_reason(reason)
    }

    fn shutdown(&self, reason: ShutdownReason) {
        let Some(reason) = self.core.begin_shutdown(reason) else {
            return;
        };
        debug!("shutting down connection to {:?}: {}", self.core.peer_addr(), reason);

        let socket = SockRef::from(self.socket.as_ref());
        let result = if self.fin_on_error && reason.is_error() {
            // the socket is closed when the last reference is dropped after the loops terminated
            socket.set_linger(Some(Duration::ZERO))
                .and_then(|_| socket.shutdown(Shutdown::Read))
        }
        else {
            socket.shutdown(Shutdown::Both)
        };
        if let Err(e) = result {
            debug!("error shutting down socket for {:?}: {}", self.core.peer_addr(), e);
        }

        self.core.finish_shutdown();
    }

    async fn dispose(&self, reason: ShutdownReason) {
        self.core.dispose(self, reason).await
    }
}
