//! Composite call and pipe-type tags

use std::fmt;

/// Largest module base or index that fits in a tag
pub const MAX_COMPONENT: u16 = 0x0FFF;

/// First call index inside a module
pub const API_CALL: u16 = 1;

/// First pipe type index inside a module
pub const PIPE_TYPE: u16 = 1;

const SCOPE_SHIFT: u32 = 24;
const MODULE_SHIFT: u32 = 12;
const COMPONENT_MASK: u32 = MAX_COMPONENT as u32;

/// Tag scope, stored in the high byte of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Built into the agent
    Static = 0,
    /// Provided by a dynamically loaded extension
    Dynamic = 1,
    /// Used between agent components, never registered by extensions
    Internal = 2,
}

impl Scope {
    /// Map a raw scope byte back to a scope
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Static),
            1 => Some(Self::Dynamic),
            2 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// A call or pipe-type tag built from scope, module base and index.
///
/// Layout: bits 24-31 scope, bits 12-23 module base, bits 0-11 index.
/// Every in-range triple maps to a distinct tag, so modules never need a
/// central allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    /// Compose a tag. Panics (at compile time for constants) when `module`
    /// or `index` exceed [`MAX_COMPONENT`].
    pub const fn new(scope: Scope, module: u16, index: u16) -> Self {
        assert!(module <= MAX_COMPONENT, "module base out of range");
        assert!(index <= MAX_COMPONENT, "index out of range");
        Self(
            ((scope as u32) << SCOPE_SHIFT)
                | ((module as u32) << MODULE_SHIFT)
                | index as u32,
        )
    }

    /// Compose a tag, returning `None` for out-of-range components
    pub const fn try_new(scope: Scope, module: u16, index: u16) -> Option<Self> {
        if module > MAX_COMPONENT || index > MAX_COMPONENT {
            return None;
        }
        Some(Self::new(scope, module, index))
    }

    /// Wrap a raw wire value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Raw scope byte, valid or not
    pub const fn scope_bits(self) -> u8 {
        (self.0 >> SCOPE_SHIFT) as u8
    }

    /// Decoded scope, if the scope byte is known
    pub const fn scope(self) -> Option<Scope> {
        Scope::from_bits(self.scope_bits())
    }

    /// Module base
    pub const fn module(self) -> u16 {
        ((self.0 >> MODULE_SHIFT) & COMPONENT_MASK) as u16
    }

    /// Call or pipe index inside the module
    pub const fn index(self) -> u16 {
        (self.0 & COMPONENT_MASK) as u16
    }
}

impl From<u32> for Tag {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Tag> for u32 {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope() {
            Some(scope) => write!(f, "Tag({:?}/{}/{})", scope, self.module(), self.index()),
            None => write!(f, "Tag({:#010x})", self.0),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scope_bits(), self.module(), self.index())
    }
}
