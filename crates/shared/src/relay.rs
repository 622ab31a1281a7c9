use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{consts::COPY_BUFFER_SIZE, errors::CoreError, system::trigger::Trigger};

/// Byte counter around a stream, so the splice still knows how much moved
/// when the copy ends in an error.
struct Counted<T> {
    inner: T,
    read_total: u64,
}

impl<T> Counted<T> {
    fn new(inner: T) -> Self {
        Counted {
            inner,
            read_total: 0,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Counted<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.read_total += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Counted<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Pump bytes both ways until both directions reach EOF. An expected peer
/// close (reset, closed socket) after at least one transferred byte degrades
/// to a normal EOF; with nothing transferred it reports `FailedToConnect`.
/// Every other error surfaces verbatim. Setting `abort` tears the splice
/// down; the caller closes the streams by dropping them.
///
/// Returns bytes moved in each direction, `(a_to_b, b_to_a)`.
pub async fn splice<A, B>(a: A, b: B, abort: &Trigger) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a = Counted::new(a);
    let mut b = Counted::new(b);

    let copied = tokio::select! {
        _ = abort.async_wait() => return Err(CoreError::Cancelled.into()),
        result = tokio::io::copy_bidirectional_with_sizes(
            &mut a,
            &mut b,
            COPY_BUFFER_SIZE,
            COPY_BUFFER_SIZE,
        ) => result,
    };

    let transferred = a.read_total + b.read_total;
    match copied {
        Ok((a_to_b, b_to_a)) => Ok((a_to_b, b_to_a)),
        Err(e) if is_peer_close(&e) => {
            if transferred > 0 {
                Ok((a.read_total, b.read_total))
            } else {
                Err(CoreError::FailedToConnect.into())
            }
        }
        Err(e) => Err(e.into()),
    }
}
