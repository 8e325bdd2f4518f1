use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::point::{Point, PointValue};

/// Outcome of one queued read after a commit.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub point: Point,
    pub outcome: Result<PointValue, ProtocolError>,
}

/// Outcome of one queued write after a commit.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub value: PointValue,
    pub outcome: Result<(), ProtocolError>,
}

/// Client surface of a field protocol: queue reads and writes cheaply,
/// then commit them as batched protocol transactions.
///
/// Requests queued to the same remote device are coalesced into the
/// smallest set of protocol fragments the wire allows. A commit fails
/// fast per remote: the first failing fragment cancels the remainder for
/// that remote, and the error propagates to each affected request.
#[async_trait]
pub trait PointExchange: Send + Sync {
    /// Unique identifier for this client instance (e.g. "dnp3-rtu-7").
    fn id(&self) -> &str;

    /// Materialize the connection. Fails with `ServiceUnavailable` after
    /// all configured retries.
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    /// Enqueue a read. Cheap, no network traffic.
    fn request_read(&mut self, point: Point);

    /// Enqueue a write. Cheap, no network traffic.
    fn request_write(&mut self, value: PointValue, point: Point);

    /// Discard queued reads without network traffic.
    fn rollback_reads(&mut self);

    /// Discard queued writes without network traffic.
    fn rollback_writes(&mut self);

    /// Flush all queued reads and wait for every response. Results come
    /// back in request order.
    async fn commit_reads(&mut self) -> Vec<ReadResult>;

    /// Flush all queued writes and wait for every acknowledgement.
    async fn commit_writes(&mut self) -> Vec<WriteResult>;

    /// Close the connection. Outstanding commits resolve as `Cancelled`.
    async fn disconnect(&mut self) -> Result<(), ProtocolError>;

    /// Blocking convenience: one round trip for a set of points.
    async fn fetch_point_values(&mut self, points: &[Point]) -> Vec<Option<PointValue>> {
        for point in points {
            self.request_read(point.clone());
        }
        self.commit_reads()
            .await
            .into_iter()
            .map(|result| result.outcome.ok())
            .collect()
    }

    /// Blocking convenience: one round trip writing a set of values.
    /// Returns `None` per success, `Some(error)` per failed request.
    async fn update_point_values(
        &mut self,
        values: &[(PointValue, Point)],
    ) -> Vec<Option<ProtocolError>> {
        for (value, point) in values {
            self.request_write(value.clone(), point.clone());
        }
        self.commit_writes()
            .await
            .into_iter()
            .map(|result| result.outcome.err())
            .collect()
    }
}
