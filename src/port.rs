//! # Port Layer
//!
//! A [`Port`] is the shared half-duplex medium all devices of a client talk
//! over. It moves raw bytes only; framing belongs to the device codecs.
//!
//! ## Reading frames
//!
//! [`Port::read_frame`] waits up to `response` for the first byte. After
//! that, each further chunk must arrive within `frame` or the frame is
//! considered finished. Reading also stops as soon as the codec's
//! completion predicate accepts the buffer, so a well-formed response never
//! costs an extra frame timeout.
//!
//! ## Implementations
//!
//! - [`TcpPort`]: serial line behind a transparent TCP gateway
//! - [`SerialPort`]: local serial device (feature `rtu`)

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{MAX_NOISE_BYTES, NOISE_TIMEOUT};
use crate::error::{SerialError, SerialResult, TransientError};
use crate::logging::{log_frame, Direction};

/// Timeouts of one frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimeouts {
    /// Wait for the first byte
    pub response: Duration,
    /// Wait between chunks of the same frame
    pub frame: Duration,
}

impl FrameTimeouts {
    pub fn new(response: Duration, frame: Duration) -> Self {
        Self { response, frame }
    }
}

/// Timing of one device's transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    pub timeouts: FrameTimeouts,
    /// Quiet time before each request
    pub guard_interval: Duration,
}

impl LinkTiming {
    /// Wait out the guard interval.
    pub async fn guard(&self) {
        if !self.guard_interval.is_zero() {
            tokio::time::sleep(self.guard_interval).await;
        }
    }
}

/// Port traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub timeouts: u64,
    pub noise_bytes: u64,
}

/// Byte transport shared by the devices of one client.
pub trait Port: Send {
    /// Open the underlying connection.
    fn open(&mut self) -> impl Future<Output = SerialResult<()>> + Send;

    /// Close the underlying connection.
    fn close(&mut self) -> impl Future<Output = SerialResult<()>> + Send;

    /// Check if the port is open.
    fn is_open(&self) -> bool;

    /// Fail with [`TransientError::PortClosed`] unless the port is open.
    fn check_open(&self) -> SerialResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransientError::PortClosed.into())
        }
    }

    /// Send a complete frame.
    fn write_bytes(&mut self, buf: &[u8]) -> impl Future<Output = SerialResult<()>> + Send;

    /// Read one frame into `buf`, returning its length.
    ///
    /// Fails with a timeout if nothing arrives within `timeouts.response`.
    fn read_frame<F>(
        &mut self,
        buf: &mut [u8],
        timeouts: FrameTimeouts,
        frame_complete: F,
    ) -> impl Future<Output = SerialResult<usize>> + Send
    where
        F: Fn(&[u8]) -> bool + Send;

    /// Discard whatever is pending on the line, returning the byte count.
    fn skip_noise(&mut self) -> impl Future<Output = SerialResult<usize>> + Send;

    /// Traffic counters.
    fn stats(&self) -> PortStats;
}

// ============================================================================
// Stream helpers
// ============================================================================

/// Read one frame from an async stream.
pub async fn read_frame_from<S, F>(
    stream: &mut S,
    buf: &mut [u8],
    timeouts: FrameTimeouts,
    frame_complete: F,
) -> SerialResult<usize>
where
    S: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    let mut len = 0;
    let mut wait = timeouts.response;
    while len < buf.len() {
        match timeout(wait, stream.read(&mut buf[len..])).await {
            Ok(Ok(0)) => return Err(SerialError::io("connection closed by peer")),
            Ok(Ok(n)) => {
                len += n;
                if frame_complete(&buf[..len]) {
                    break;
                }
                wait = timeouts.frame;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if len == 0 => {
                return Err(SerialError::timeout(
                    "response",
                    timeouts.response.as_millis() as u64,
                ))
            }
            // inter-frame gap: the frame is over
            Err(_) => break,
        }
    }
    Ok(len)
}

/// Drain pending bytes until the line stays quiet for [`NOISE_TIMEOUT`].
pub async fn skip_noise_from<S>(stream: &mut S) -> SerialResult<usize>
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 64];
    let mut skipped = 0;
    while skipped < MAX_NOISE_BYTES {
        match timeout(NOISE_TIMEOUT, stream.read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                log_frame(Direction::Noise, &scratch[..n]);
                skipped += n;
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(skipped)
}

async fn write_all_to<S>(stream: &mut S, buf: &[u8]) -> SerialResult<()>
where
    S: AsyncWrite + Unpin,
{
    log_frame(Direction::Tx, buf);
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

fn record_read(stats: &mut PortStats, result: &SerialResult<usize>, buf: &[u8]) {
    match result {
        Ok(n) => {
            log_frame(Direction::Rx, &buf[..*n]);
            stats.frames_received += 1;
            stats.bytes_received += *n as u64;
        }
        Err(e) if e.is_timeout() => stats.timeouts += 1,
        Err(_) => {}
    }
}

// ============================================================================
// TCP gateway
// ============================================================================

/// Serial line reached through a transparent TCP gateway.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use voltage_serial::{Port, TcpPort};
///
/// # async fn example() -> voltage_serial::SerialResult<()> {
/// let mut port = TcpPort::new("192.168.1.50:4001").with_connect_timeout(Duration::from_secs(2));
/// port.open().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TcpPort {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    stats: PortStats,
}

impl TcpPort {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            stream: None,
            stats: PortStats::default(),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn stream_mut(&mut self) -> SerialResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransientError::PortClosed.into())
    }
}

impl Port for TcpPort {
    async fn open(&mut self) -> SerialResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                SerialError::timeout(
                    format!("connect to {}", self.address),
                    self.connect_timeout.as_millis() as u64,
                )
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", self.address, e);
        }
        info!("Connected to serial gateway {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> SerialResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!("Closed connection to {}", self.address);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> SerialResult<()> {
        let stream = self.stream_mut()?;
        write_all_to(stream, buf).await?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Ok(())
    }

    async fn read_frame<F>(
        &mut self,
        buf: &mut [u8],
        timeouts: FrameTimeouts,
        frame_complete: F,
    ) -> SerialResult<usize>
    where
        F: Fn(&[u8]) -> bool + Send,
    {
        let stream = self.stream_mut()?;
        let result = read_frame_from(stream, buf, timeouts, frame_complete).await;
        record_read(&mut self.stats, &result, buf);
        result
    }

    async fn skip_noise(&mut self) -> SerialResult<usize> {
        let stream = self.stream_mut()?;
        let skipped = skip_noise_from(stream).await?;
        self.stats.noise_bytes += skipped as u64;
        Ok(skipped)
    }

    fn stats(&self) -> PortStats {
        self.stats
    }
}

// ============================================================================
// Local serial device
// ============================================================================

#[cfg(feature = "rtu")]
pub use self::serial::SerialPort;

#[cfg(feature = "rtu")]
mod serial {
    use super::*;
    use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

    /// Local serial device.
    #[derive(Debug)]
    pub struct SerialPort {
        path: String,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
        stream: Option<SerialStream>,
        stats: PortStats,
    }

    impl SerialPort {
        /// 8N1 port at `baud_rate`.
        pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                path: path.into(),
                baud_rate,
                data_bits: DataBits::Eight,
                parity: Parity::None,
                stop_bits: StopBits::One,
                stream: None,
                stats: PortStats::default(),
            }
        }

        pub fn with_parity(mut self, parity: Parity) -> Self {
            self.parity = parity;
            self
        }

        pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
            self.stop_bits = stop_bits;
            self
        }

        pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
            self.data_bits = data_bits;
            self
        }

        fn stream_mut(&mut self) -> SerialResult<&mut SerialStream> {
            self.stream
                .as_mut()
                .ok_or_else(|| TransientError::PortClosed.into())
        }
    }

    impl Port for SerialPort {
        async fn open(&mut self) -> SerialResult<()> {
            if self.stream.is_some() {
                return Ok(());
            }
            let builder = tokio_serial::new(&self.path, self.baud_rate)
                .data_bits(self.data_bits)
                .parity(self.parity)
                .stop_bits(self.stop_bits);
            let stream = SerialStream::open(&builder).map_err(|e| {
                SerialError::io(format!("failed to open serial port {}: {}", self.path, e))
            })?;
            info!("Opened serial port {} at {} baud", self.path, self.baud_rate);
            self.stream = Some(stream);
            Ok(())
        }

        async fn close(&mut self) -> SerialResult<()> {
            if self.stream.take().is_some() {
                debug!("Closed serial port {}", self.path);
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }

        async fn write_bytes(&mut self, buf: &[u8]) -> SerialResult<()> {
            let stream = self.stream_mut()?;
            write_all_to(stream, buf).await?;
            self.stats.frames_sent += 1;
            self.stats.bytes_sent += buf.len() as u64;
            Ok(())
        }

        async fn read_frame<F>(
            &mut self,
            buf: &mut [u8],
            timeouts: FrameTimeouts,
            frame_complete: F,
        ) -> SerialResult<usize>
        where
            F: Fn(&[u8]) -> bool + Send,
        {
            let stream = self.stream_mut()?;
            let result = read_frame_from(stream, buf, timeouts, frame_complete).await;
            record_read(&mut self.stats, &result, buf);
            result
        }

        async fn skip_noise(&mut self) -> SerialResult<usize> {
            let stream = self.stream_mut()?;
            let skipped = skip_noise_from(stream).await?;
            self.stats.noise_bytes += skipped as u64;
            Ok(skipped)
        }

        fn stats(&self) -> PortStats {
            self.stats
        }
    }
}

// ============================================================================
// Mock port
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct MockState {
        /// Records all frames written
        written: Vec<Vec<u8>>,
        /// Pre-configured replies (FIFO queue)
        replies: VecDeque<SerialResult<Vec<u8>>>,
        open: bool,
        noise_skips: usize,
        opens: usize,
    }

    /// Scripted port. Clones share state, so a test keeps one clone while
    /// the client owns another.
    #[derive(Debug, Clone, Default)]
    pub struct MockPort {
        state: Arc<Mutex<MockState>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a reply frame.
        pub fn reply(&self, frame: impl Into<Vec<u8>>) {
            self.state.lock().unwrap().replies.push_back(Ok(frame.into()));
        }

        /// Queue a read error.
        pub fn fail(&self, error: SerialError) {
            self.state.lock().unwrap().replies.push_back(Err(error));
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn noise_skips(&self) -> usize {
            self.state.lock().unwrap().noise_skips
        }

        pub fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }

        pub fn pending_replies(&self) -> usize {
            self.state.lock().unwrap().replies.len()
        }
    }

    impl Port for MockPort {
        async fn open(&mut self) -> SerialResult<()> {
            let mut state = self.state.lock().unwrap();
            state.open = true;
            state.opens += 1;
            Ok(())
        }

        async fn close(&mut self) -> SerialResult<()> {
            self.state.lock().unwrap().open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.state.lock().unwrap().open
        }

        async fn write_bytes(&mut self, buf: &[u8]) -> SerialResult<()> {
            self.check_open()?;
            self.state.lock().unwrap().written.push(buf.to_vec());
            Ok(())
        }

        async fn read_frame<F>(
            &mut self,
            buf: &mut [u8],
            timeouts: FrameTimeouts,
            _frame_complete: F,
        ) -> SerialResult<usize>
        where
            F: Fn(&[u8]) -> bool + Send,
        {
            self.check_open()?;
            let reply = self.state.lock().unwrap().replies.pop_front();
            match reply {
                Some(Ok(frame)) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(SerialError::timeout(
                    "response",
                    timeouts.response.as_millis() as u64,
                )),
            }
        }

        async fn skip_noise(&mut self) -> SerialResult<usize> {
            self.state.lock().unwrap().noise_skips += 1;
            Ok(0)
        }

        fn stats(&self) -> PortStats {
            PortStats::default()
        }
    }
}
