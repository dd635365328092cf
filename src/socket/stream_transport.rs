use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tracing::{debug, error, trace, Instrument, Span};
use crate::buffers::read_buffer::ReadBuffer;
use crate::error::ShutdownReason;
use crate::io_queue::IoQueueSettings;
use crate::pipe::{DuplexPipe, PipeReader, PipeWriter};
use crate::socket::{ErrorClass, Transport, TransportCore, MIN_ALLOC_BUFFER_SIZE};

/// A transport over any async byte stream, used for TLS and for the stream transport kind. The
///  stream is closed when both loops terminated and dropped their halves.
pub struct StreamTransport {
    core: TransportCore,
}

impl StreamTransport {
    pub fn start<S>(stream: S, peer_addr: SocketAddr, settings: &IoQueueSettings) -> (Arc<StreamTransport>, DuplexPipe)
    where S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (transport_pipe, application_pipe) = DuplexPipe::pair(&settings.block_pool, settings.input_options, settings.output_options);
        let DuplexPipe { input: output_reader, output: input_writer } = transport_pipe;

        let transport = Arc::new(StreamTransport {
            core: TransportCore::new(peer_addr, input_writer.control(), output_reader.control()),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let receive_task = settings.scheduler.spawn(
            transport.clone().do_receive(read_half, input_writer)
                .instrument(Span::current())
        );
        let send_task = settings.scheduler.spawn(
            transport.clone().do_send(write_half, output_reader)
                .instrument(Span::current())
        );
        transport.core.set_tasks(receive_task, send_task);

        (transport, application_pipe)
    }

    async fn do_receive<S: AsyncRead>(self: Arc<Self>, mut stream: ReadHalf<S>, mut input: PipeWriter) {
        let result = select! {
            r = Self::receive_loop(&mut stream, &mut input) => r,
            _ = self.core.shutdown_token().cancelled() => Ok(false),
        };

        match result {
            Ok(true) => {
                debug!("stream closed by peer {:?}", self.core.peer_addr());
                self.core.record_reason(ShutdownReason::PeerClosed);
            }
            Ok(false) => {}
            Err(e) => self.record_io_error(e, "receiving"),
        }
        input.complete();
    }

    /// returns `true` if the peer closed the stream
    async fn receive_loop<S: AsyncRead>(stream: &mut ReadHalf<S>, input: &mut PipeWriter) -> io::Result<bool> {
        loop {
            let memory = input.get_memory(MIN_ALLOC_BUFFER_SIZE);
            let num_read = stream.read(memory).await?;
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

    async fn do_send<S: AsyncWrite>(self: Arc<Self>, mut stream: WriteHalf<S>, mut output: PipeReader) {
        if let Err(e) = self.send_loop(&mut stream, &mut output).await {
            self.record_io_error(e, "sending");
        }
        output.complete();
        self.shutdown(ShutdownReason::SendLoopCompleted);
    }

    async fn send_loop<S: AsyncWrite>(&self, stream: &mut WriteHalf<S>, output: &mut PipeReader) -> io::Result<()> {
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
                select! {
                    r = Self::write_segments(stream, &buffer) => r?,
                    _ = self.core.shutdown_token().cancelled() => return Ok(()),
                }
                output.advance(buffer.len());
            }

            if read_result.is_completed {
                // close_notify for TLS, FIN for plain streams
                return stream.shutdown().await;
            }
        }
    }

    async fn write_segments<S: AsyncWrite>(stream: &mut WriteHalf<S>, buffer: &ReadBuffer) -> io::Result<()> {
        for segment in buffer.segments() {
            stream.write_all(segment).await?;
        }
        stream.flush().await
    }

    fn record_io_error(&self, e: io::Error, activity: &str) {
        match ErrorClass::classify(&e) {
            ErrorClass::Graceful => debug!("stream to {:?} reset while {}: {}", self.core.peer_addr(), activity, e),
            ErrorClass::Aborted => debug!("{} from {:?} aborted: {}", activity, self.core.peer_addr(), e),
            ErrorClass::Unexpected => error!("unexpected error {} {:?}: {}", activity, self.core.peer_addr(), e),
        }
        self.core.record_reason(ErrorClass::shutdown_reason(&e));
    }
}

#[async_trait]
impl Transport for StreamTransport {
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
        if let Some(reason) = self.core.begin_shutdown(reason) {
            debug!("shutting down stream to {:?}: {}", self.core.peer_addr(), reason);
            self.core.finish_shutdown();
        }
    }

    async fn dispose(&self, reason: ShutdownReason) {
        self.core.dispose(self, reason).await
    }
}
