use crate::verbs::type_alias::*;

/// Remote registered memory.
///
/// This structure contains remote memory region information and does
/// not hold any verbs resources locally. Unlike [`Mr`](super::Mr), it
/// can represent a slice of the remote region by letting `addr` and
/// `len` correspond to only a part of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MrRemote {
    pub addr: u64,
    pub len: usize,
    pub rkey: RKey,
}

impl MrRemote {
    /// Create a new piece of remote registered memory data.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Create a dummy `MrRemote` with all fields set to zero.
    pub fn dummy() -> Self {
        Self::new(0, 0, 0)
    }

    /// Get an address at the given offset.
    #[inline]
    pub fn at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }

    /// Narrow to the sub-range `[offset, offset + len)`. Return `None`
    /// if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        if offset.checked_add(len)? <= self.len {
            Some(Self::new(self.at(offset), len, self.rkey))
        } else {
            None
        }
    }
}

impl Default for MrRemote {
    /// Create a dummy `MrRemote` with all fields set to zero.
    fn default() -> Self {
        Self::dummy()
    }
}
