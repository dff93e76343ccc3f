//! Frame logging
//!
//! Wire frames are logged at `debug` level under the `voltage_serial::frames`
//! target, so they can be switched on separately:
//!
//! ```text
//! RUST_LOG=voltage_serial::frames=debug
//! ```

use std::fmt;

use tracing::debug;

/// Log target of wire frames.
pub const FRAME_TARGET: &str = "voltage_serial::frames";

/// Direction of a logged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
    /// Bytes discarded while skipping line noise
    Noise,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
            Self::Noise => "NOISE",
        })
    }
}

/// Displays bytes as space-separated upper-case hex.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Log a wire frame.
#[inline]
pub fn log_frame(direction: Direction, bytes: &[u8]) {
    debug!(target: FRAME_TARGET, "{} [{}] {}", direction, bytes.len(), HexBytes(bytes));
}

/// Install a formatting subscriber; `RUST_LOG` overrides `level`.
#[cfg(feature = "demo")]
pub fn init(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
