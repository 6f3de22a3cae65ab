//! Protection domain and the memory-region key table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::verbs::context::Context;
use crate::verbs::cq::WcStatus;
use crate::verbs::error::{Result, VerbsError};
use crate::verbs::mr::{MrRemote, Permission, RegionGuard};
use crate::verbs::type_alias::*;
use crate::verbs::wr::{ResolvedSge, Sge};

use super::mr::MrState;

struct PdInner {
    ctx: Context,

    /// Key table of the regions registered on this domain. Weak: the
    /// table never keeps a region alive; a region whose handles are all
    /// gone simply stops resolving.
    regions: Mutex<HashMap<LKey, Weak<MrState>>>,
}

/// Protection domain.
///
/// The domain owns the key table that authorizes memory access: every
/// scatter/gather element of a posted work request is resolved against
/// it, and remote keys presented by RDMA operations are checked against
/// the target's domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pd")
    }
}

impl Pd {
    /// Allocate a new protection domain on the given device.
    pub fn new(ctx: &Context) -> Self {
        Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub(crate) fn insert_region(&self, state: &Arc<MrState>) {
        self.inner
            .regions
            .lock()
            .unwrap()
            .insert(state.lkey, Arc::downgrade(state));
    }

    /// Deregister a region: check for in-flight references and retire
    /// the key, all under the key-table lock so that no new reference
    /// can be granted concurrently.
    pub(crate) fn deregister(&self, state: &Arc<MrState>) -> Result<()> {
        let mut regions = self.inner.regions.lock().unwrap();
        if !state.is_valid() {
            return Err(VerbsError::InvalidParameter("memory region already deregistered"));
        }
        if state.in_flight() > 0 {
            return Err(VerbsError::ResourceBusy(
                "outstanding work requests reference the memory region",
            ));
        }
        state.invalidate();
        regions.remove(&state.lkey);
        Ok(())
    }

    /// Invalidate a local key without deregistering the handle. Used by
    /// local-invalidate work requests. Returns false if the key does
    /// not resolve.
    pub(crate) fn invalidate(&self, key: LKey) -> bool {
        let mut regions = self.inner.regions.lock().unwrap();
        match regions.get(&key).and_then(Weak::upgrade) {
            Some(state) => {
                state.invalidate();
                regions.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Resolve one local scatter/gather element: the key must be live,
    /// the range in bounds, and the region must grant `need`. On
    /// success the returned guard marks the region in flight until the
    /// work retires.
    pub(crate) fn resolve_sge(&self, sge: &Sge, need: Permission) -> Result<RegionGuard> {
        let regions = self.inner.regions.lock().unwrap();
        let state = regions
            .get(&sge.lkey)
            .and_then(Weak::upgrade)
            .ok_or(VerbsError::InvalidParameter("unknown local key"))?;
        if !state.is_valid() {
            return Err(VerbsError::InvalidParameter("local key has been invalidated"));
        }
        if !state.covers(sge.addr, sge.len as usize) {
            return Err(VerbsError::InvalidParameter("scatter/gather range out of region bounds"));
        }
        if !state.perm.contains(need) {
            return Err(VerbsError::InvalidParameter(
                "memory region does not grant the required access",
            ));
        }
        Ok(state.guard())
    }

    /// Resolve a whole scatter/gather list. Returns the flat address
    /// ranges, the in-flight guards, and the total byte length.
    pub(crate) fn resolve_sgl(
        &self,
        sgl: &[Sge],
        need: Permission,
    ) -> Result<(Vec<ResolvedSge>, Vec<RegionGuard>, u32)> {
        let mut resolved = Vec::with_capacity(sgl.len());
        let mut guards = Vec::with_capacity(sgl.len());
        let mut total: u64 = 0;
        for sge in sgl {
            guards.push(self.resolve_sge(sge, need)?);
            resolved.push(ResolvedSge {
                addr: sge.addr,
                len: sge.len,
            });
            total += sge.len as u64;
        }
        if total > u32::MAX as u64 {
            return Err(VerbsError::InvalidParameter("scatter/gather list too long"));
        }
        Ok((resolved, guards, total as u32))
    }

    /// Validate a remote-key access against this domain, as the target
    /// of an RDMA or atomic operation. Failures map to the CQE status
    /// the requester observes.
    pub(crate) fn check_remote(
        &self,
        remote: &MrRemote,
        need: Permission,
    ) -> std::result::Result<Arc<MrState>, WcStatus> {
        let regions = self.inner.regions.lock().unwrap();
        let state = regions
            .get(&remote.rkey)
            .and_then(Weak::upgrade)
            .ok_or(WcStatus::RemAccessErr)?;
        if !state.is_valid()
            || !state.covers(remote.addr, remote.len)
            || !state.perm.contains(need)
        {
            return Err(WcStatus::RemAccessErr);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::device::DeviceConfig;
    use crate::verbs::mr::Mr;

    fn setup() -> Pd {
        let ctx = Context::open(DeviceConfig::default()).unwrap();
        Pd::new(&ctx)
    }

    #[test]
    fn test_resolve_sge() {
        let pd = setup();
        let buf = vec![0u8; 128];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();

        let sge = Sge::from(mr.as_slice());
        let guard = pd.resolve_sge(&sge, Permission::LOCAL_WRITE).unwrap();
        drop(guard);

        // Unknown key.
        let bad = Sge {
            lkey: mr.lkey() + 100,
            ..sge
        };
        assert!(matches!(
            pd.resolve_sge(&bad, Permission::EMPTY),
            Err(VerbsError::InvalidParameter(_))
        ));

        // Out of bounds.
        let bad = Sge {
            len: 4096,
            ..sge
        };
        assert!(matches!(
            pd.resolve_sge(&bad, Permission::EMPTY),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_resolve_permission() {
        let pd = setup();
        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::EMPTY).unwrap();
        let sge = Sge::from(mr.as_slice());
        assert!(pd.resolve_sge(&sge, Permission::EMPTY).is_ok());
        assert!(pd.resolve_sge(&sge, Permission::LOCAL_WRITE).is_err());
    }

    #[test]
    fn test_deregister_blocks_resolution() {
        let pd = setup();
        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        let sge = Sge::from(mr.as_slice());
        mr.deregister().unwrap();
        assert!(pd.resolve_sge(&sge, Permission::EMPTY).is_err());
    }

    #[test]
    fn test_check_remote() {
        let pd = setup();
        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::LOCAL_WRITE).unwrap();
        let remote = mr.as_remote();
        // Region does not grant remote write.
        assert_eq!(
            pd.check_remote(&remote, Permission::REMOTE_WRITE).err(),
            Some(WcStatus::RemAccessErr)
        );
    }
}
