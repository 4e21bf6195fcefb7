//! Utilities shared by the mark and sweep schedulers.

/// Addresses and object references.
pub mod address;
/// Logger initialization.
pub mod logger;
/// The mark bitmap covering the heap.
pub mod mark_bitmap;
/// Weighted averages and rate interpolation used by tuning.
pub mod math;
/// Collector options.
pub mod options;
pub(crate) mod spin_limiter;

/// Wrappers around crate-private functions, for benchmarks.
#[cfg(feature = "test_private")]
pub mod test_private;

/// Test utilities, including the in-memory runtime used by integration tests.
#[cfg(any(test, feature = "mock_test"))]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
