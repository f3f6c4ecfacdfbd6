//! Linux interposition via symbol preemption: this crate, built as a
//! `cdylib` and loaded with `LD_PRELOAD`, exports `malloc`/`free`/etc.
//! under their real names, so the dynamic linker resolves every call in
//! the process to these functions instead of glibc's.
//!
//! Each hook resolves the *real* allocator function lazily via
//! `dlsym(RTLD_NEXT, ...)` and caches it in a static. The classic
//! bootstrapping hazard: glibc's own `dlsym` implementation calls
//! `calloc` once, on first use, before it can return our real `malloc`
//! to us — so a `calloc` that arrives while we're still inside that
//! very `dlsym` call must be satisfied from a static bump allocator
//! instead of recursing (spec §4.11 "Interposer bootstrap" edge case).

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::error::HeapError;

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut libc::c_void;
type FreeFn = unsafe extern "C" fn(*mut libc::c_void);
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut libc::c_void;
type ReallocFn = unsafe extern "C" fn(*mut libc::c_void, libc::size_t) -> *mut libc::c_void;
type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut libc::c_void, libc::size_t, libc::size_t) -> libc::c_int;
type AlignedAllocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut libc::c_void;

static REAL_MALLOC: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_FREE: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_CALLOC: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_REALLOC: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_POSIX_MEMALIGN: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_ALIGNED_ALLOC: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());

static INSTALLED: AtomicBool = AtomicBool::new(false);
static RESOLVING: std::sync::Once = std::sync::Once::new();

/// Bootstrap bump allocator: serves `calloc` calls made by `dlsym`
/// itself, before [`REAL_CALLOC`] is populated. Sized generously for
/// glibc's own bookkeeping (a handful of small allocations) and never
/// reclaimed — this is a few hundred bytes for the life of the process,
/// not a leak pattern that scales with allocation count.
const BOOTSTRAP_HEAP_SIZE: usize = 64 * 1024;
static mut BOOTSTRAP_HEAP: [u8; BOOTSTRAP_HEAP_SIZE] = [0; BOOTSTRAP_HEAP_SIZE];
static BOOTSTRAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_alloc(size: usize) -> *mut libc::c_void {
    let aligned = (size + 15) & !15;
    let offset = BOOTSTRAP_OFFSET.fetch_add(aligned, Ordering::SeqCst);
    if offset + aligned > BOOTSTRAP_HEAP_SIZE {
        return std::ptr::null_mut();
    }
    unsafe {
        let ptr = std::ptr::addr_of_mut!(BOOTSTRAP_HEAP) as *mut u8;
        ptr.add(offset).cast::<libc::c_void>()
    }
}

fn is_bootstrap_ptr(ptr: *mut libc::c_void) -> bool {
    unsafe {
        let base = std::ptr::addr_of!(BOOTSTRAP_HEAP) as *const u8 as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + BOOTSTRAP_HEAP_SIZE
    }
}

fn resolve_real_symbols() {
    RESOLVING.call_once(|| unsafe {
        let malloc_name = CString::new("malloc").unwrap();
        let free_name = CString::new("free").unwrap();
        let calloc_name = CString::new("calloc").unwrap();
        let realloc_name = CString::new("realloc").unwrap();
        let posix_memalign_name = CString::new("posix_memalign").unwrap();
        let aligned_alloc_name = CString::new("aligned_alloc").unwrap();

        REAL_MALLOC.store(libc::dlsym(libc::RTLD_NEXT, malloc_name.as_ptr()), Ordering::Release);
        REAL_FREE.store(libc::dlsym(libc::RTLD_NEXT, free_name.as_ptr()), Ordering::Release);
        REAL_CALLOC.store(libc::dlsym(libc::RTLD_NEXT, calloc_name.as_ptr()), Ordering::Release);
        REAL_REALLOC.store(libc::dlsym(libc::RTLD_NEXT, realloc_name.as_ptr()), Ordering::Release);
        REAL_POSIX_MEMALIGN.store(
            libc::dlsym(libc::RTLD_NEXT, posix_memalign_name.as_ptr()),
            Ordering::Release,
        );
        REAL_ALIGNED_ALLOC.store(
            libc::dlsym(libc::RTLD_NEXT, aligned_alloc_name.as_ptr()),
            Ordering::Release,
        );
    });
}

pub fn install() -> Result<(), HeapError> {
    resolve_real_symbols();
    if REAL_MALLOC.load(Ordering::Acquire).is_null() || REAL_FREE.load(Ordering::Acquire).is_null() {
        return Err(HeapError::InterposerBootstrapFailed(
            "dlsym(RTLD_NEXT, ...) returned null for malloc/free".to_string(),
        ));
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

pub fn uninstall() {
    INSTALLED.store(false, Ordering::Release);
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

fn on_alloc(ptr: *mut libc::c_void, size: usize) {
    if !is_installed() || ptr.is_null() {
        return;
    }
    crate::record_allocation(ptr as u64, size);
}

fn on_free(ptr: *mut libc::c_void) {
    if !is_installed() || ptr.is_null() {
        return;
    }
    crate::record_free(ptr as u64);
}

#[no_mangle]
pub extern "C" fn malloc(size: libc::size_t) -> *mut libc::c_void {
    resolve_real_symbols();
    let real = REAL_MALLOC.load(Ordering::Acquire);
    if real.is_null() {
        return bootstrap_alloc(size);
    }
    let real: MallocFn = unsafe { std::mem::transmute(real) };
    let ptr = unsafe { real(size) };
    on_alloc(ptr, size as usize);
    ptr
}

#[no_mangle]
pub extern "C" fn free(ptr: *mut libc::c_void) {
    if ptr.is_null() {
        return;
    }
    if is_bootstrap_ptr(ptr) {
        // Bootstrap allocations are never individually freed.
        return;
    }
    on_free(ptr);
    resolve_real_symbols();
    let real = REAL_FREE.load(Ordering::Acquire);
    if real.is_null() {
        return;
    }
    let real: FreeFn = unsafe { std::mem::transmute(real) };
    unsafe { real(ptr) }
}

#[no_mangle]
pub extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut libc::c_void {
    let real = REAL_CALLOC.load(Ordering::Acquire);
    if real.is_null() {
        // Either still resolving (the dlsym-calls-calloc bootstrap case)
        // or resolution hasn't started yet; both are served from the
        // bump allocator, zeroed as calloc requires.
        let total = nmemb.saturating_mul(size) as usize;
        let ptr = bootstrap_alloc(total);
        if !ptr.is_null() {
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, total) };
        }
        return ptr;
    }
    let real: CallocFn = unsafe { std::mem::transmute(real) };
    let ptr = unsafe { real(nmemb, size) };
    on_alloc(ptr, (nmemb as usize).saturating_mul(size as usize));
    ptr
}

#[no_mangle]
pub extern "C" fn realloc(ptr: *mut libc::c_void, size: libc::size_t) -> *mut libc::c_void {
    resolve_real_symbols();
    if !ptr.is_null() && !is_bootstrap_ptr(ptr) {
        on_free(ptr);
    }
    let real = REAL_REALLOC.load(Ordering::Acquire);
    if real.is_null() {
        return bootstrap_alloc(size as usize);
    }
    let real: ReallocFn = unsafe { std::mem::transmute(real) };
    let new_ptr = unsafe { real(ptr, size) };
    on_alloc(new_ptr, size as usize);
    new_ptr
}

#[no_mangle]
pub extern "C" fn posix_memalign(
    memptr: *mut *mut libc::c_void,
    alignment: libc::size_t,
    size: libc::size_t,
) -> libc::c_int {
    resolve_real_symbols();
    let real = REAL_POSIX_MEMALIGN.load(Ordering::Acquire);
    if real.is_null() {
        return libc::ENOMEM;
    }
    let real: PosixMemalignFn = unsafe { std::mem::transmute(real) };
    let rc = unsafe { real(memptr, alignment, size) };
    if rc == 0 {
        on_alloc(unsafe { *memptr }, size as usize);
    }
    rc
}

#[no_mangle]
pub extern "C" fn aligned_alloc(alignment: libc::size_t, size: libc::size_t) -> *mut libc::c_void {
    resolve_real_symbols();
    let real = REAL_ALIGNED_ALLOC.load(Ordering::Acquire);
    if real.is_null() {
        return std::ptr::null_mut();
    }
    let real: AlignedAllocFn = unsafe { std::mem::transmute(real) };
    let ptr = unsafe { real(alignment, size) };
    on_alloc(ptr, size as usize);
    ptr
}

#[no_mangle]
pub extern "C" fn memalign(alignment: libc::size_t, size: libc::size_t) -> *mut libc::c_void {
    aligned_alloc(alignment, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_allocator_serves_sequential_requests_without_overlap() {
        BOOTSTRAP_OFFSET.store(0, Ordering::SeqCst);
        let a = bootstrap_alloc(64);
        let b = bootstrap_alloc(64);
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert!(is_bootstrap_ptr(a));
        assert!(is_bootstrap_ptr(b));
    }

    #[test]
    fn bootstrap_allocator_reports_exhaustion_as_null() {
        BOOTSTRAP_OFFSET.store(BOOTSTRAP_HEAP_SIZE, Ordering::SeqCst);
        assert!(bootstrap_alloc(16).is_null());
        BOOTSTRAP_OFFSET.store(0, Ordering::SeqCst);
    }
}
