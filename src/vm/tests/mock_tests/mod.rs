// Every test here builds its own collector over a MockVM, so tests are independent of each
// other and can run in parallel. Only tests that touch GENCON_* environment variables need
// `serial_test`.

// Common includes for mock tests.
pub(crate) mod mock_test_prelude {
    pub use crate::concurrent::{AbortReason, AllocationRequest, ExecutionMode};
    pub use crate::memory_manager;
    pub use crate::util::test_util::mock_vm::*;
    pub use crate::util::test_util::*;
    pub use crate::vm::*;
    pub use std::sync::atomic::Ordering;
}

mod mock_test_abort;
mod mock_test_allocate;
mod mock_test_concurrent_cycle;
mod mock_test_heap_resize;
mod mock_test_helpers;
mod mock_test_kickoff;
mod mock_test_sweep;
