//! Splice bridge between a TCP socket and a uTP stream (§4.3).
//!
//! Grounded directly in `utp_bufferevent.h`'s two entry points:
//! `tcp_connect_utp` (a freshly-accepted TCP client gets spliced onto an
//! outbound uTP connection — the helper's `listener_cb`) and
//! `utp_connect_tcp` (a freshly-accepted uTP connection gets spliced onto
//! a local TCP connection — the injector's `utp_on_accept`). The original
//! pumps bytes between a `struct bufferevent` on each side with libevent's
//! built-in high/low watermarks; this achieves the same effect structurally
//! instead — see [`HIGH_WATERMARK`]'s doc comment — using a pair of
//! cooperative copy arms sharing one task.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::transport::{TransportError, UtpStream};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Nominal high watermark (§4.3): the buffered-output level past which a
/// direction's reads ought to pause. This bridge has no free-running
/// buffer to gate in the first place — each direction's `write` below is
/// fully awaited before that direction's next `read` is issued, so a slow
/// peer stalls the read feeding it directly, with no unbounded queue ever
/// building up between them. A prior revision tracked a `pending_to_*`
/// byte counter against this constant as a read-gate condition, but since
/// the counter was reset to 0 well before it could reach this value
/// (`< HIGH_WATERMARK` never went false), the gate was dead code; removed
/// in favor of documenting the structural back-pressure that was doing
/// the actual work all along.
pub const HIGH_WATERMARK: usize = 256 * 1024;
/// Low watermark: the drain threshold implied by [`HIGH_WATERMARK`]'s
/// intent (`evbuffer`'s pair in the original); see [`HIGH_WATERMARK`]'s
/// doc comment for why no counter here is tracked against it either.
pub const LOW_WATERMARK: usize = 64 * 1024;

const COPY_CHUNK: usize = 16 * 1024;

/// Splices `tcp` and `utp` together until either side closes, propagating
/// a half-close instead of tearing down the whole bridge immediately (a
/// `bufferevent` shutdown on one side in the original still lets the other
/// direction drain). Back-pressure is structural rather than counted: each
/// arm below awaits its `write` to completion before its `read` is
/// selected again, so a direction whose peer stops draining stalls that
/// direction's reads with no separate watermark bookkeeping needed.
pub async fn splice<U: UtpStream>(mut tcp: TcpStream, mut utp: U) -> Result<(), BridgeError> {
    let (mut tcp_read, mut tcp_write) = tcp.split();

    let mut tcp_to_utp_done = false;
    let mut utp_to_tcp_done = false;

    let mut buf = vec![0u8; COPY_CHUNK];

    loop {
        if tcp_to_utp_done && utp_to_tcp_done {
            break;
        }

        tokio::select! {
            result = tcp_read.read(&mut buf), if !tcp_to_utp_done => {
                match result? {
                    0 => {
                        utp.shutdown_write().await?;
                        tcp_to_utp_done = true;
                    }
                    n => {
                        utp.write(Bytes::copy_from_slice(&buf[..n])).await?;
                    }
                }
            }
            result = utp.read(), if !utp_to_tcp_done => {
                match result? {
                    None => {
                        let _ = tcp_write.shutdown().await;
                        utp_to_tcp_done = true;
                    }
                    Some(chunk) => {
                        tcp_write.write_all(&chunk).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake_stream_pair;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    fn addr(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 7001)
    }

    #[tokio::test]
    async fn forwards_bytes_both_directions_and_propagates_half_close() {
        let (server_tcp, mut client_tcp) = loopback_pair().await;
        let (bridge_side, mut test_side) = fake_stream_pair(addr(1), addr(2));

        let bridge = tokio::spawn(async move { splice(server_tcp, bridge_side).await });

        client_tcp.write_all(b"to-injector").await.unwrap();
        let got = test_side.read().await.unwrap().unwrap();
        assert_eq!(&got[..], b"to-injector");

        test_side.write(Bytes::from_static(b"to-client")).await.unwrap();
        let mut got2 = vec![0u8; 9];
        client_tcp.read_exact(&mut got2).await.unwrap();
        assert_eq!(&got2, b"to-client");

        client_tcp.shutdown().await.unwrap();
        assert_eq!(test_side.read().await.unwrap(), None);

        test_side.shutdown_write().await.unwrap();
        bridge.await.unwrap().unwrap();
    }
}
