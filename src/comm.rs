//! Collective operations across processes.
//!
//! Every process holds a full copy of the global boundary vectors but only accumulates the
//! contributions of the elements it owns. The reductions below merge those partial results.

/// Synchronous collectives supplied by the parallel transport layer.
pub trait Communicator<T> {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    /// Replaces each entry by its sum over all processes.
    fn reduce_sum(&self, values: &mut [T]);

    /// Replaces each entry by its maximum over all processes.
    fn reduce_max(&self, values: &mut [usize]);
}

/// The single-process communicator: all reductions are no-ops.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialCommunicator;

impl<T> Communicator<T> for SerialCommunicator {
    fn reduce_sum(&self, _values: &mut [T]) {}

    fn reduce_max(&self, _values: &mut [usize]) {}
}

impl<'a, T, C> Communicator<T> for &'a C
where
    C: ?Sized + Communicator<T>,
{
    fn rank(&self) -> usize {
        C::rank(self)
    }

    fn size(&self) -> usize {
        C::size(self)
    }

    fn reduce_sum(&self, values: &mut [T]) {
        C::reduce_sum(self, values)
    }

    fn reduce_max(&self, values: &mut [usize]) {
        C::reduce_max(self, values)
    }
}
