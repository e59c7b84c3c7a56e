pub mod fping;
pub mod measurement;
pub mod parse;

use anyhow::Result;

pub use self::fping::ProbeProcess;
pub use self::measurement::{Measurement, Outcome};

/// LineSource yields probe output one line at a time.
///
/// `next_line` must be cancel safe: the monitor races it against the
/// shutdown token and drops the future when interrupted.
pub trait LineSource: Send {
    /// Read the next line. `Ok(None)` means the output has ended.
    fn next_line(&mut self) -> impl std::future::Future<Output = Result<Option<String>>> + Send;

    /// Terminate the producer and release its resources.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
