/// [`u8`]: **Port number**, identifies a port on the local HCA.
pub type PortNum = u8;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a work request.
pub type WrId = u64;

/// [`u64`]: **Work queue sequence number**, stamped on a work request at
/// post time. Monotonic per queue; completions are released in sequence
/// order.
pub type Seq = u64;
