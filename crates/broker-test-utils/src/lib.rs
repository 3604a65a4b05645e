// broker-test-utils: Shared test utilities for the broker suite.
//
// Provides a raw TCP STOMP client for integration testing: frame-level
// send/receive with timeouts, plus a CONNECT handshake helper.

use std::net::SocketAddr;

use bytes::BytesMut;
use stomp_wire::{Command, Frame, FrameDecoder, WireEvent, encode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockStompClient {
    stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl MockStompClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(MockStompClient {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            decoder: FrameDecoder::new(),
        })
    }

    /// Connect and run the CONNECT handshake; returns the client and the
    /// CONNECTED frame.
    pub async fn connect_session(
        addr: SocketAddr,
        accept_version: &str,
        host: Option<&str>,
    ) -> Result<(Self, Frame), Box<dyn std::error::Error>> {
        let mut client = Self::connect(addr).await?;
        let mut connect = Frame::new(Command::Connect).with_header("accept-version", accept_version);
        if let Some(host) = host {
            connect = connect.with_header("host", host);
        }
        client.send_frame(&connect).await?;
        let connected = client.recv_frame().await?;
        if connected.command != Command::Connected {
            return Err(format!("expected CONNECTED, got {:?}", connected.command).into());
        }
        Ok((client, connected))
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let mut buf = BytesMut::new();
        encode(frame, &mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Raw bytes straight onto the socket (malformed frames, keep-alives).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Next wire event, keep-alives included.
    pub async fn recv_event(&mut self) -> Result<WireEvent, Box<dyn std::error::Error>> {
        loop {
            if let Some(event) = self.decoder.decode(&mut self.buf)? {
                return Ok(event);
            }
            let n = timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf)).await??;
            if n == 0 {
                return Err("connection closed by server".into());
            }
        }
    }

    /// Next full frame, skipping keep-alives.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            match self.recv_event().await? {
                WireEvent::Frame(frame) => return Ok(frame),
                WireEvent::KeepAlive => {}
            }
        }
    }

    /// Next frame if one arrives within `wait`; None on timeout or close.
    /// For asserting that nothing is delivered.
    pub async fn try_recv_frame(&mut self, wait: Duration) -> Option<Frame> {
        match timeout(wait, self.recv_frame()).await {
            Ok(Ok(frame)) => Some(frame),
            _ => None,
        }
    }

    /// True when the server closes the connection within the timeout.
    pub async fn expect_closed(&mut self) -> bool {
        let mut probe = [0u8; 256];
        loop {
            match timeout(RECV_TIMEOUT, self.stream.read(&mut probe)).await {
                Ok(Ok(0)) => return true,
                // Drain whatever the server flushes before closing.
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}
