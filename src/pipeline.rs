//! Reader/writer task pair for the channel-pipeline connection model.
//!
//! Each connection runs two tasks: the reader fills freshly allocated
//! buffers and queues them, the writer takes them in order, flips their case
//! and writes them back. The queue decouples read cadence from write
//! cadence; with a capacity bound the reader suspends on a full queue.
//!
//! Both tasks live in a per-connection `JoinSet` that owns the stream
//! halves. Whichever way the connection ends (disconnect, I/O failure or
//! cancellation), dropping the set aborts any task still suspended on I/O
//! and the socket is closed once both halves are gone.

use crate::completion::{self, is_disconnect, ReadOutcome};
use crate::transform::flip_case;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Per-connection tuning taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Capacity of each buffer the reader allocates.
    pub read_chunk_size: usize,
    /// Queue bound between reader and writer; 0 means unbounded.
    pub channel_capacity: usize,
}

/// Producer end of the reader-to-writer queue.
#[derive(Debug)]
pub enum TransferSender {
    Bounded(mpsc::Sender<BytesMut>),
    Unbounded(mpsc::UnboundedSender<BytesMut>),
}

/// Consumer end of the reader-to-writer queue.
#[derive(Debug)]
pub enum TransferReceiver {
    Bounded(mpsc::Receiver<BytesMut>),
    Unbounded(mpsc::UnboundedReceiver<BytesMut>),
}

/// Create a FIFO queue of buffers. `capacity == 0` selects an unbounded queue.
pub fn transfer_channel(capacity: usize) -> (TransferSender, TransferReceiver) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransferSender::Unbounded(tx), TransferReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (TransferSender::Bounded(tx), TransferReceiver::Bounded(rx))
    }
}

impl TransferSender {
    /// Queue a buffer, suspending while a bounded queue is full.
    ///
    /// Returns the buffer if the receiver is gone.
    pub async fn send(&self, buf: BytesMut) -> Result<(), BytesMut> {
        match self {
            TransferSender::Bounded(tx) => tx.send(buf).await.map_err(|e| e.0),
            TransferSender::Unbounded(tx) => tx.send(buf).map_err(|e| e.0),
        }
    }
}

impl TransferReceiver {
    /// Next buffer in FIFO order, or `None` once the sender is dropped and the queue drained.
    pub async fn recv(&mut self) -> Option<BytesMut> {
        match self {
            TransferReceiver::Bounded(rx) => rx.recv().await,
            TransferReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Which task of the pair finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Reader,
    Writer,
}

impl Half {
    fn op(self) -> &'static str {
        match self {
            Half::Reader => "read",
            Half::Writer => "write",
        }
    }
}

/// How a connection's pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Both tasks ran to completion or the peer went away.
    Finished,
    /// The pipeline was cancelled from outside.
    Cancelled,
}

/// Serve one connection until the peer disconnects, I/O fails or `cancel` fires.
///
/// Returns only after both tasks have ended and the stream has been dropped.
pub async fn process_connection<S>(
    stream: S,
    peer: SocketAddr,
    settings: PipelineSettings,
    mut cancel: watch::Receiver<bool>,
) -> Exit
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = transfer_channel(settings.channel_capacity);

    let mut tasks = JoinSet::new();
    let reader_task = tasks.spawn(async move {
        (Half::Reader, read_loop(reader, tx, settings.read_chunk_size, peer).await)
    });
    tasks.spawn(async move { (Half::Writer, write_loop(writer, rx, peer).await) });

    loop {
        tokio::select! {
            _ = signalled(&mut cancel) => {
                warn!(peer = %peer, "Connection cancelled");
                tasks.shutdown().await;
                return Exit::Cancelled;
            }
            joined = tasks.join_next() => match joined {
                None => return Exit::Finished,
                Some(Ok((half, result))) => {
                    log_exit(half, &result, peer);
                    // Nothing more can be echoed once the writer is gone.
                    if half == Half::Writer {
                        reader_task.abort();
                    }
                }
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => {
                    error!(peer = %peer, error = %e, "Connection task panicked");
                    tasks.shutdown().await;
                    return Exit::Finished;
                }
            }
        }
    }
}

fn log_exit(half: Half, result: &io::Result<()>, peer: SocketAddr) {
    match result {
        Ok(()) => debug!(peer = %peer, op = half.op(), "Task finished"),
        Err(e) if is_disconnect(e) => {
            info!(peer = %peer, op = half.op(), error = %e, "Client disconnected")
        }
        Err(e) => error!(peer = %peer, op = half.op(), error = %e, "I/O failure"),
    }
}

/// Resolve once `flag` is set. Never resolves if the sender is dropped unset.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let sender_dropped = flag.wait_for(|set| *set).await.is_err();
    if sender_dropped {
        std::future::pending::<()>().await;
    }
}

/// Read into fresh buffers and queue every non-empty one.
///
/// Ends on EOF or when the writer has gone; dropping `tx` lets the writer
/// drain what is queued and stop.
async fn read_loop<R>(
    mut reader: R,
    tx: TransferSender,
    chunk_size: usize,
    peer: SocketAddr,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        match completion::read(&mut reader, &mut buf).await? {
            ReadOutcome::Closed => {
                info!(peer = %peer, "Client closed the connection");
                return Ok(());
            }
            ReadOutcome::Empty => continue,
            ReadOutcome::Data(_) => {
                if tx.send(buf).await.is_err() {
                    debug!(peer = %peer, "Writer gone, stopping reader");
                    return Ok(());
                }
            }
        }
    }
}

/// Transform and write every queued buffer in order, handling partial writes.
async fn write_loop<W>(mut writer: W, mut rx: TransferReceiver, peer: SocketAddr) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut buf) = rx.recv().await {
        flip_case(&mut buf);
        let mut pending = &buf[..];
        while !pending.is_empty() {
            let n = completion::write(&mut writer, pending).await?;
            pending = &pending[n..];
        }
    }
    debug!(peer = %peer, "Reader finished and queue drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_pending, assert_ready};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn settings(channel_capacity: usize) -> PipelineSettings {
        PipelineSettings {
            read_chunk_size: 80,
            channel_capacity,
        }
    }

    #[tokio::test]
    async fn test_transfer_channel_is_fifo() {
        let (tx, mut rx) = transfer_channel(0);
        for chunk in [&b"one"[..], b"two", b"three"] {
            tx.send(BytesMut::from(chunk)).await.unwrap();
        }
        drop(tx);

        assert_eq!(&rx.recv().await.unwrap()[..], b"one");
        assert_eq!(&rx.recv().await.unwrap()[..], b"two");
        assert_eq!(&rx.recv().await.unwrap()[..], b"three");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_bounded_channel_suspends_sender_when_full() {
        let (tx, mut rx) = transfer_channel(1);

        let mut first = tokio_test::task::spawn(tx.send(BytesMut::from(&b"a"[..])));
        assert!(assert_ready!(first.poll()).is_ok());
        drop(first);

        let mut second = tokio_test::task::spawn(tx.send(BytesMut::from(&b"b"[..])));
        assert_pending!(second.poll());

        let mut recv = tokio_test::task::spawn(rx.recv());
        assert_eq!(&assert_ready!(recv.poll()).unwrap()[..], b"a");
        drop(recv);

        assert!(second.is_woken());
        assert!(assert_ready!(second.poll()).is_ok());
    }

    #[tokio::test]
    async fn test_reader_queues_each_read_until_eof() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Hello")
            .read(b" world")
            .build();
        let (tx, mut rx) = transfer_channel(0);

        read_loop(mock, tx, 80, peer()).await.unwrap();

        assert_eq!(&rx.recv().await.unwrap()[..], b"Hello");
        assert_eq!(&rx.recv().await.unwrap()[..], b" world");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_splits_at_chunk_size() {
        let mock = tokio_test::io::Builder::new().read(b"abcdefgh").build();
        let (tx, mut rx) = transfer_channel(0);

        read_loop(mock, tx, 3, peer()).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(buf) = rx.recv().await {
            chunks.push(buf.to_vec());
        }
        assert_eq!(chunks, vec![b"abc".to_vec(), b"def".to_vec(), b"gh".to_vec()]);
    }

    #[tokio::test]
    async fn test_writer_retries_partial_writes() {
        let mock = tokio_test::io::Builder::new()
            .write(b"hE")
            .write(b"L")
            .write(b"LO")
            .write(b"WORLD")
            .build();
        let (tx, rx) = transfer_channel(0);
        tx.send(BytesMut::from(&b"Hello"[..])).await.unwrap();
        tx.send(BytesMut::from(&b"world"[..])).await.unwrap();
        drop(tx);

        write_loop(mock, rx, peer()).await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_stops_on_disconnect() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::ErrorKind::BrokenPipe.into())
            .build();
        let (tx, rx) = transfer_channel(0);
        tx.send(BytesMut::from(&b"x"[..])).await.unwrap();
        tx.send(BytesMut::from(&b"never written"[..])).await.unwrap();

        let err = write_loop(mock, rx, peer()).await.unwrap_err();
        assert!(is_disconnect(&err));
    }

    #[tokio::test]
    async fn test_pipeline_echoes_until_half_close() {
        let (mut client, server) = tokio::io::duplex(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let pipeline = tokio::spawn(process_connection(server, peer(), settings(0), cancel_rx));

        let payload: Vec<u8> = (0..=u8::MAX).cycle().take(1000).collect();
        let mut expected = payload.clone();
        flip_case(&mut expected);

        let (mut rd, mut wr) = tokio::io::split(&mut client);
        let send = async {
            wr.write_all(&payload).await.unwrap();
            wr.shutdown().await.unwrap();
        };
        let mut out = Vec::new();
        let recv = rd.read_to_end(&mut out);
        let (_, received) = tokio::join!(send, recv);
        received.unwrap();

        assert_eq!(out, expected);
        assert_eq!(pipeline.await.unwrap(), Exit::Finished);
    }

    #[tokio::test]
    async fn test_pipeline_bounded_channel_echoes() {
        let (mut client, server) = tokio::io::duplex(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let pipeline = tokio::spawn(process_connection(server, peer(), settings(1), cancel_rx));

        client.write_all(b"Backpressure").await.unwrap();
        let mut out = [0u8; 12];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"bACKPRESSURE");

        drop(client);
        assert_eq!(pipeline.await.unwrap(), Exit::Finished);
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_while_read_outstanding() {
        let (mut client, server) = tokio::io::duplex(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let pipeline = tokio::spawn(process_connection(server, peer(), settings(0), cancel_rx));

        client.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"PING");

        // The reader is now suspended waiting for more input.
        cancel_tx.send_replace(true);
        assert_eq!(pipeline.await.unwrap(), Exit::Cancelled);

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("stream not closed after cancellation")
            .unwrap();
        assert_eq!(n, 0);
    }
}
