#[cfg(not(target_pointer_width = "64"))]
compile_error!("heaplet supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::heap::{GlobalHeap, Heap, HeapConfig, HeapStats};

// errors
pub use memory::heap::HeapError;
pub use memory::vm::VmError;
