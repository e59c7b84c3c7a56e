pub mod influx;
pub mod point;

use anyhow::Result;

pub use self::influx::InfluxStore;
pub use self::point::Point;

/// Store owns the connection to the time-series database.
pub trait Store: Send {
    /// Create the target database if it does not exist and select it.
    ///
    /// Safe to call more than once; an existing database is never recreated.
    fn ensure_ready(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Write a single point to the selected database. No retries.
    fn write(&mut self, point: &Point) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Release the connection.
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
