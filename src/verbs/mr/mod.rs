//! Memory region registration.

mod perm;
mod remote;

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub use self::perm::Permission;
pub use self::remote::MrRemote;

use crate::verbs::error::{Result, VerbsError};
use crate::verbs::pd::Pd;
use crate::verbs::type_alias::*;
use crate::verbs::wr::Sge;

/// A pinned virtual address range.
///
/// Created with `mlock(2)` and released with `munlock(2)` on drop.
/// Pinned pages are a scarce resource bounded by `RLIMIT_MEMLOCK`.
struct PinnedRange {
    ptr: *mut libc::c_void,
    len: usize,
}

// The raw pointer is only used for the munlock call on drop.
unsafe impl Send for PinnedRange {}
unsafe impl Sync for PinnedRange {}

impl PinnedRange {
    fn pin(addr: u64, len: usize) -> Result<Self> {
        let ptr = addr as *mut libc::c_void;
        // SAFETY: mlock does not dereference; it operates on the pages
        // covering the range.
        let ret = unsafe { libc::mlock(ptr, len) };
        if ret != 0 {
            return Err(VerbsError::InsufficientResources("failed to pin memory"));
        }
        Ok(Self { ptr, len })
    }
}

impl Drop for PinnedRange {
    fn drop(&mut self) {
        // SAFETY: the range was pinned by `pin` and is unpinned once.
        unsafe { libc::munlock(self.ptr, self.len) };
    }
}

/// Shared state of a registered memory region.
///
/// Work queue entries referencing the region hold an [`RegionGuard`]
/// onto this state, which keeps the pinning alive and blocks
/// deregistration until the work has retired.
pub(crate) struct MrState {
    pub(crate) addr: u64,
    pub(crate) len: usize,
    pub(crate) perm: Permission,
    pub(crate) lkey: LKey,
    pub(crate) rkey: RKey,

    /// Cleared by deregistration (or a local-invalidate work request).
    valid: AtomicBool,

    /// Number of outstanding work queue entries referencing the region.
    in_flight: AtomicUsize,

    #[allow(dead_code)]
    pin: Option<PinnedRange>,
}

impl MrState {
    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Check that `[addr, addr + len)` lies within the region.
    pub(crate) fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr
            && len <= self.len
            && addr - self.addr <= (self.len - len) as u64
    }

    pub(crate) fn guard(self: &Arc<Self>) -> RegionGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        RegionGuard(self.clone())
    }
}

/// In-flight reference onto a memory region. Dropped when the work
/// queue entry referencing the region retires.
pub(crate) struct RegionGuard(Arc<MrState>);

impl fmt::Debug for RegionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionGuard")
            .field("lkey", &self.0.lkey)
            .finish_non_exhaustive()
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Local registered memory region.
///
/// A memory region is a virtual memory range registered to the device,
/// addressable in work requests through the local key and remotely
/// through the remote key. The registered memory itself does not belong
/// to this type; registration only authorizes access to it.
///
/// Deregistration is explicit ([`Mr::deregister`]) and fails while
/// outstanding work references the region. Dropping all `Mr` handles
/// without deregistering retires the key as well, but only once no
/// in-flight work holds the region.
#[derive(Clone)]
pub struct Mr {
    pd: Pd,
    state: Arc<MrState>,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.state.addr)
            .field("len", &self.state.len)
            .field("lkey", &self.state.lkey)
            .finish()
    }
}

impl Mr {
    /// Register the memory range of the given buffer.
    ///
    /// The caller must keep the buffer alive and in place until the
    /// region is deregistered and no posted work references it; the
    /// device addresses the memory by its raw location.
    pub fn register(pd: &Pd, buf: &[u8], perm: Permission) -> Result<Self> {
        // SAFETY: the slice is a live memory range.
        unsafe { Self::register_raw(pd, buf.as_ptr() as *mut u8, buf.len(), perm) }
    }

    /// Register a raw memory range.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be a valid, live memory range for the
    /// whole time the region (or any work referencing it) exists, and
    /// writable if the region will be the target of receives, RDMA
    /// writes or atomics.
    pub unsafe fn register_raw(
        pd: &Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> Result<Self> {
        if len == 0 {
            return Err(VerbsError::InvalidParameter("cannot register a zero-length region"));
        }
        if addr.is_null() {
            return Err(VerbsError::InvalidParameter("cannot register a null address"));
        }

        let pin = if pd.context().config().pin_memory {
            Some(PinnedRange::pin(addr as u64, len)?)
        } else {
            None
        };

        let key = pd.context().alloc_key();
        let state = Arc::new(MrState {
            addr: addr as u64,
            len,
            perm,
            lkey: key,
            rkey: key,
            valid: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            pin,
        });
        pd.insert_region(&state);
        Ok(Self {
            pd: pd.clone(),
            state,
        })
    }

    /// Deregister the memory region, releasing its keys and pinning.
    ///
    /// Fails with `ResourceBusy` if outstanding work queue entries
    /// still reference the region; retry after they have completed.
    pub fn deregister(&self) -> Result<()> {
        self.pd.deregister(&self.state)
    }

    /// Get the protection domain of the memory region.
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the start address of the registered memory range.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.state.addr
    }

    /// Get the length of the registered memory range.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.len
    }

    /// Check whether the registered memory range is empty. Always
    /// false: zero-length ranges cannot be registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.state.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.state.rkey
    }

    /// Get the access permissions of the memory region.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.state.perm
    }

    /// Get remote memory information for the entire region, to be
    /// handed to the peer that will access it.
    pub fn as_remote(&self) -> MrRemote {
        MrRemote::new(self.state.addr, self.state.len, self.state.rkey)
    }

    /// Get a memory region slice that represents the entire range.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice::new(self, 0..self.len())
    }

    /// Get a memory region slice that represents the specified range.
    /// Return `None` if the range is out of bounds.
    #[inline]
    pub fn get_slice(&self, r: Range<usize>) -> Option<MrSlice<'_>> {
        if r.start <= r.end && r.end <= self.len() {
            Some(MrSlice::new(self, r))
        } else {
            None
        }
    }
}

/// Slice of a local memory region.
///
/// A slice corresponds to one scatter/gather element, usable in work
/// requests.
#[derive(Debug, Clone)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    range: Range<usize>,
}

impl<'a> MrSlice<'a> {
    /// Create a new memory region slice of the given MR and range.
    pub fn new(mr: &'a Mr, range: Range<usize>) -> Self {
        Self { mr, range }
    }

    /// Get the starting address of the slice.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.mr.addr() + self.range.start as u64
    }

    /// Get the length of the slice.
    #[inline]
    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    /// Check whether the slice is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Get the underlying `Mr`.
    #[inline]
    pub fn mr(&self) -> &Mr {
        self.mr
    }

    /// Sub-slice this slice. Return `None` if the range is out of bounds.
    #[inline]
    pub fn get_slice(&self, r: Range<usize>) -> Option<MrSlice<'a>> {
        if r.start <= r.end && r.end <= self.len() {
            Some(MrSlice::new(
                self.mr,
                (self.range.start + r.start)..(self.range.start + r.end),
            ))
        } else {
            None
        }
    }
}

impl From<MrSlice<'_>> for Sge {
    fn from(slice: MrSlice<'_>) -> Self {
        Self {
            addr: slice.addr(),
            len: slice.len() as u32,
            lkey: slice.mr.lkey(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::context::Context;
    use crate::verbs::device::DeviceConfig;

    fn setup() -> Pd {
        let ctx = Context::open(DeviceConfig::default()).unwrap();
        Pd::new(&ctx)
    }

    #[test]
    fn test_register() {
        let pd = setup();
        let buf = vec![0u8; 4096];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        assert_eq!(mr.len(), 4096);
        assert_eq!(mr.addr(), buf.as_ptr() as u64);
        mr.deregister().unwrap();
    }

    #[test]
    fn test_register_empty() {
        let pd = setup();
        let buf: Vec<u8> = Vec::new();
        assert!(matches!(
            Mr::register(&pd, &buf, Permission::default()),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_deregister_twice() {
        let pd = setup();
        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        mr.deregister().unwrap();
        assert!(matches!(
            mr.deregister(),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_slicing() {
        let pd = setup();
        let buf = vec![0u8; 256];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();

        let slice = mr.get_slice(64..128).unwrap();
        assert_eq!(slice.addr(), mr.addr() + 64);
        assert_eq!(slice.len(), 64);

        let sub = slice.get_slice(16..32).unwrap();
        assert_eq!(sub.addr(), mr.addr() + 80);

        assert!(mr.get_slice(200..512).is_none());
    }
}
