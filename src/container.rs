//! A container is a size - specifically 32 or 64 bit - along with an
//! endianness; together they are the parsing context threaded through every
//! on-disk record reader.

use scroll::Endian;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The size of a binary container
pub enum Container {
    /// 32-bit
    Little,
    /// 64-bit
    Big,
}

impl Container {
    /// Is this a 64-bit container?
    pub fn is_big(self) -> bool {
        self == Container::Big
    }
    /// The size in bytes of a pointer in this container
    pub fn pointer_size(self) -> u64 {
        match self {
            Container::Little => 4,
            Container::Big => 8,
        }
    }
}

#[cfg(target_pointer_width = "32")]
/// The default container size for the host machine
pub const CONTAINER: Container = Container::Little;

#[cfg(target_pointer_width = "64")]
/// The default container size for the host machine
pub const CONTAINER: Container = Container::Big;

impl Default for Container {
    #[inline]
    fn default() -> Self {
        CONTAINER
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// A parsing context: the container size and endianness of the binary
pub struct Ctx {
    /// The size of this binary container
    pub container: Container,
    /// The endianness of this binary
    pub le: Endian,
}

impl Ctx {
    /// Creates a new `Ctx`
    pub fn new(container: Container, le: Endian) -> Self {
        Ctx { container, le }
    }
    /// Whether this binary is 64-bit
    pub fn is_big(&self) -> bool {
        self.container.is_big()
    }
    /// Whether this binary is little-endian
    pub fn is_little_endian(&self) -> bool {
        self.le.is_little()
    }
    /// The size in bytes of a pointer
    pub fn pointer_size(&self) -> u64 {
        self.container.pointer_size()
    }
}

impl Default for Ctx {
    #[inline]
    fn default() -> Self {
        Ctx {
            container: Container::default(),
            le: Endian::default(),
        }
    }
}

impl From<Container> for Ctx {
    fn from(container: Container) -> Self {
        Ctx {
            container,
            le: Endian::default(),
        }
    }
}
