//! Domain types shared across the communication layer
//!
//! Strongly-typed values for node identity, atomic operation descriptors,
//! and validated configuration quantities, to keep primitive obsession out
//! of the hot paths.

use nutype::nutype;

/// Identity of one node in the job: an integer in `[0, N)`.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct NodeId(u32);

impl NodeId {
    /// Node id as a table index.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.into_inner() as usize
    }

    /// Builds a node id from a table index.
    #[must_use]
    pub fn from_usize(n: usize) -> Self {
        Self::new(n as u32)
    }
}

/// Datatypes the AMO engine operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AmoType {
    I32 = 0,
    U32 = 1,
    I64 = 2,
    U64 = 3,
    F32 = 4,
    F64 = 5,
}

impl AmoType {
    /// All types the runtime may request, in probe order.
    pub const ALL: [AmoType; 6] = [
        AmoType::I32,
        AmoType::U32,
        AmoType::I64,
        AmoType::U64,
        AmoType::F32,
        AmoType::F64,
    ];

    /// Operand width in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            AmoType::I32 | AmoType::U32 | AmoType::F32 => 4,
            AmoType::I64 | AmoType::U64 | AmoType::F64 => 8,
        }
    }

    /// True for the floating-point types.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, AmoType::F32 | AmoType::F64)
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// Operations the AMO engine implements.
///
/// Subtraction is rewritten as addition of the negated operand before it
/// reaches the fabric or the CPU matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AmoOp {
    Write = 0,
    Read = 1,
    Xchg = 2,
    Add = 3,
    Sub = 4,
    Or = 5,
    And = 6,
    Xor = 7,
    Cswap = 8,
}

impl AmoOp {
    /// The operation set probed against the provider for integer types.
    pub const INT_PROBE: [AmoOp; 7] = [
        AmoOp::Add,
        AmoOp::Or,
        AmoOp::And,
        AmoOp::Xor,
        AmoOp::Write,
        AmoOp::Read,
        AmoOp::Cswap,
    ];

    /// The operation set probed for floating-point types.
    pub const FLOAT_PROBE: [AmoOp; 4] = [AmoOp::Add, AmoOp::Write, AmoOp::Read, AmoOp::Cswap];

    /// True when the operation writes the target object.
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, AmoOp::Read)
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        const ALL: [AmoOp; 9] = [
            AmoOp::Write,
            AmoOp::Read,
            AmoOp::Xchg,
            AmoOp::Add,
            AmoOp::Sub,
            AmoOp::Or,
            AmoOp::And,
            AmoOp::Xor,
            AmoOp::Cswap,
        ];
        ALL.get(raw as usize).copied()
    }
}

/// Cap on the number of transmit contexts; 0 means "size from the provider".
#[nutype(
    validate(less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct ConcurrencyCap(usize);

impl ConcurrencyCap {
    /// Gets the cap as usize; 0 means auto.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Size of each multi-receive landing zone in bytes.
#[nutype(
    validate(greater_or_equal = 4096, less_or_equal = 1_073_741_824),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 262_144
)]
pub struct MultiRecvBufSize(usize);

impl MultiRecvBufSize {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Target interval between liveness probes, in seconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct LivenessIntervalSecs(u64);

impl LivenessIntervalSecs {
    #[must_use]
    pub fn as_secs(&self) -> u64 {
        self.into_inner()
    }
}

/// Size of the registered heap arena the layer allocates internal
/// structures (landing zones, bounce buffers, done bytes) from.
#[nutype(
    validate(greater_or_equal = 65_536, less_or_equal = 4_294_967_296),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 16_777_216
)]
pub struct RegisteredHeapSize(usize);

impl RegisteredHeapSize {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_indexing() {
        let n = NodeId::from_usize(63);
        assert_eq!(n.as_usize(), 63);
        assert_eq!(NodeId::new(63), n);
    }

    #[test]
    fn amo_type_widths() {
        assert_eq!(AmoType::I32.size(), 4);
        assert_eq!(AmoType::F64.size(), 8);
        assert!(AmoType::F32.is_float());
        assert!(!AmoType::U64.is_float());
    }

    #[test]
    fn amo_wire_tags_round_trip() {
        for ty in AmoType::ALL {
            assert_eq!(AmoType::from_wire(ty as u8), Some(ty));
        }
        assert_eq!(AmoType::from_wire(17), None);
        assert_eq!(AmoOp::from_wire(AmoOp::Cswap as u8), Some(AmoOp::Cswap));
        assert_eq!(AmoOp::from_wire(99), None);
    }

    #[test]
    fn concurrency_cap_validates_range() {
        assert!(ConcurrencyCap::try_new(0).is_ok());
        assert!(ConcurrencyCap::try_new(1024).is_ok());
        assert!(ConcurrencyCap::try_new(1025).is_err());
    }
}
