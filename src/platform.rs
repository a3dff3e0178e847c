use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The release engine
/// needs very little from the kernel: a page size, scratch pages for its
/// counter buffers, and a way to tell the kernel that a range of pages holds
/// no useful data anymore. It doesn't care about the APIs offered by the
/// underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a zero-initialized memory region from the kernel where
    /// `length` bytes can be written safely. Returns [`None`] if the kernel
    /// refuses, callers are expected to handle that. When `populate` is
    /// true the kernel is asked to back the pages upfront so that the first
    /// write doesn't page fault; platforms without such a hint ignore it.
    unsafe fn request_memory(length: usize, populate: bool) -> Pointer<u8>;

    /// Returns `length` bytes starting from `address` to the underlying
    /// kernel. The memory must have been obtained through
    /// [`Self::request_memory`].
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Advises the kernel that `length` bytes starting at `address` contain
    /// no data worth keeping, so their physical backing may be reclaimed.
    /// The virtual range stays valid and reads back as zeroes whenever the
    /// kernel actually gets around to it. Purely advisory and idempotent,
    /// failures are ignored.
    unsafe fn release_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize, populate: bool) -> Pointer<u8> {
    Platform::request_memory(length, populate)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::release_memory`].
#[inline]
pub(crate) unsafe fn release_memory(address: NonNull<u8>, length: usize) {
    Platform::release_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize, populate: bool) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file. Anonymous mappings are returned zeroed, which is exactly
            // what counter buffers need.
            #[allow(unused_mut)]
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // Prefault the pages so that counter updates don't take page
            // fault exceptions one by one. Linux only, other kernels back
            // the pages lazily and that's fine too.
            #[cfg(target_os = "linux")]
            if populate {
                flags |= libc::MAP_POPULATE;
            }
            #[cfg(not(target_os = "linux"))]
            let _ = populate;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is still
                // valid here, it wasn't unmapped.
            }
        }

        unsafe fn release_memory(address: NonNull<u8>, length: usize) {
            // The kernel may drop the physical pages whenever it wants, the
            // mapping itself stays in place and reads back as zeroes. See
            // https://man7.org/linux/man-pages/man2/madvise.2.html
            libc::madvise(address.cast().as_ptr(), length, libc::MADV_DONTNEED);
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize, _populate: bool) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only. Committed pages are
            // zero-initialized by the kernel.
            let protection = Memory::PAGE_READWRITE;

            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable. We
            // can do both at the same time with one single call. Committing
            // upfront is already the closest thing to a populate hint that
            // this API offers.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // We have to decommit memory first and then release it. We can
            // skip decommitting by specifying length of 0 and MEM_RELEASE
            // flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, length, flags).as_bool() {
                // TODO: Release failed, don't know what to do here yet. Same
                // problem as munmap on Linux.
            }
        }

        unsafe fn release_memory(address: NonNull<u8>, length: usize) {
            // MEM_RESET is the advisory counterpart of madvise: the pages
            // stay committed but their contents become disposable.
            let address: *const std::ffi::c_void = address.cast().as_ptr();
            Memory::VirtualAlloc(
                Some(address),
                length,
                Memory::MEM_RESET,
                Memory::PAGE_READWRITE,
            );
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory management. This is also useful for detecting
    //! counter buffers that are never returned.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize, _populate: bool) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn release_memory(_address: NonNull<u8>, _length: usize) {
            // Advisory call, nothing to mock.
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
