use cadence_core::FenceValue;

/// A container of fence-tagged resources that the submission tracker
/// retires after every completion query.
pub trait Reclaim: Send + Sync {
    /// Name used in logs.
    fn label(&self) -> &'static str;

    /// Recycles or destroys everything tagged `<= completed`, in tag order,
    /// stopping at the first incomplete entry. Returns the number of entries
    /// retired.
    fn reclaim_completed(&self, completed: FenceValue) -> usize;

    /// Releases everything unconditionally. Only valid once the device is
    /// idle.
    fn drain_all(&self) -> usize;
}
