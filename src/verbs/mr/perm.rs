use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Memory region permissions.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_READ: Self = Self(1 << 1);
    pub const REMOTE_WRITE: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);
    pub const MW_BIND: Self = Self(1 << 4);

    /// Check whether all permissions in `other` are granted by `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no permission is granted.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Permission {
    /// Allow local write, remote read/write, and remote atomic.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE | Self::REMOTE_ATOMIC
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permission, &str); 5] = [
            (Permission::LOCAL_WRITE, "LOCAL_WRITE"),
            (Permission::REMOTE_READ, "REMOTE_READ"),
            (Permission::REMOTE_WRITE, "REMOTE_WRITE"),
            (Permission::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
            (Permission::MW_BIND, "MW_BIND"),
        ];
        if self.is_empty() {
            return f.write_str("EMPTY");
        }
        let mut first = true;
        for (perm, name) in NAMES {
            if self.contains(perm) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl Add for Permission {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl AddAssign for Permission {
    fn add_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for Permission {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permission {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self + rhs
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        *self += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let p = Permission::default();
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(p.contains(Permission::REMOTE_READ | Permission::REMOTE_WRITE));
        assert!(!p.contains(Permission::MW_BIND));
        assert!(p.contains(Permission::EMPTY));
    }

    #[test]
    fn test_sub() {
        let p = Permission::default() - Permission::REMOTE_WRITE;
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert!(p.contains(Permission::REMOTE_READ));
    }
}
