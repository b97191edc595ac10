//! Progress reporting seam for external renderers.

/// Receiver for transfer progress events.
///
/// Implementations render progress bars, export metrics, or do nothing;
/// the core only pushes events. All methods take `&self` because they are
/// called from producer and acknowledgement threads concurrently.
pub trait Progress: Send + Sync {
    /// Compressed bytes handed to the data path.
    fn add_bytes(&self, bytes: u64);
    /// One filesystem object archived.
    fn add_object(&self);
    /// One reconnect attempt performed.
    fn add_retry(&self);
    /// Totals discovered so far by the walk.
    fn set_totals(&self, objects: u64);
    /// Active parallel stream count changed.
    fn set_streams(&self, active: u8);
}

/// Progress sink that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn add_bytes(&self, _bytes: u64) {}
    fn add_object(&self) {}
    fn add_retry(&self) {}
    fn set_totals(&self, _objects: u64) {}
    fn set_streams(&self, _active: u8) {}
}
