mod context;
mod freelist;
mod page_map;
mod platform;
mod recorder;
mod release;
mod round;

use std::ptr::NonNull;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case, and the kernel calls we wrap do fail.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use context::ReleaseContext;
pub use freelist::TransferBatch;
pub use page_map::PackedPageMap;
pub use platform::page_size;
pub use recorder::{RangeRecorder, ReleaseRecorder};
pub use release::{release_free_blocks_to_os, release_free_memory_to_os};
