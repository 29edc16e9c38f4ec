//! # Component System
//!
//! Components are plain data identified by a 64-bit hash of their name.
//! The identifier order is the order components are stored and matched in.

use bytemuck::Pod;

/// Stable identifier of a component type.
///
/// Derived from the component name with 64-bit FNV-1a, so the same name
/// always yields the same identifier across runs and builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ComponentId(u64);

impl ComponentId {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Hashes a component name into an identifier.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = Self::FNV_OFFSET;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(Self::FNV_PRIME);
            i += 1;
        }
        Self(hash)
    }

    /// Wraps a raw identifier value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Runtime description of a component: identity and memory layout.
///
/// Tag components carry no data and have both size and alignment 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentInfo {
    /// Identifier of the component.
    pub id: ComponentId,
    /// Human readable name.
    pub name: &'static str,
    /// Size of one value in bytes.
    pub size: u32,
    /// Alignment of one value in bytes.
    pub alignment: u32,
}

impl ComponentInfo {
    /// Describes a data component with an explicit layout.
    #[must_use]
    pub const fn new(name: &'static str, size: u32, alignment: u32) -> Self {
        Self {
            id: ComponentId::from_name(name),
            name,
            size,
            alignment,
        }
    }

    /// Describes a tag component.
    #[must_use]
    pub const fn tag(name: &'static str) -> Self {
        Self::new(name, 0, 0)
    }

    /// Describes the component type `T`.
    ///
    /// Zero-sized types are described as tags.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        let size = std::mem::size_of::<T>();
        if size == 0 {
            return Self {
                id: T::ID,
                name: T::NAME,
                size: 0,
                alignment: 0,
            };
        }
        Self {
            id: T::ID,
            name: T::NAME,
            size: size as u32,
            alignment: std::mem::align_of::<T>() as u32,
        }
    }

    /// Returns true if this component stores no data.
    #[inline]
    #[must_use]
    pub const fn is_tag(&self) -> bool {
        self.size == 0
    }
}

/// Marker trait for data components.
///
/// Components must be plain old data: they are zero-initialized, copied
/// and moved around as raw bytes inside data blocks.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Position {
///     x: f32,
///     y: f32,
/// }
///
/// impl Component for Position {
///     const NAME: &'static str = "game.position";
/// }
/// ```
pub trait Component: Pod + Send + Sync + 'static {
    /// Unique name of the component.
    const NAME: &'static str;

    /// Identifier derived from [`Component::NAME`].
    const ID: ComponentId = ComponentId::from_name(Self::NAME);
}

/// Marker trait for tag components.
///
/// Tags take part in archetype identity and query matching but occupy no
/// memory in data blocks.
pub trait Tag: 'static {
    /// Unique name of the tag.
    const NAME: &'static str;

    /// Identifier derived from [`Tag::NAME`].
    const ID: ComponentId = ComponentId::from_name(Self::NAME);

    /// Returns the runtime description of the tag.
    #[must_use]
    fn info() -> ComponentInfo {
        ComponentInfo {
            id: Self::ID,
            name: Self::NAME,
            size: 0,
            alignment: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Health {
        value: f32,
    }

    impl Component for Health {
        const NAME: &'static str = "test.health";
    }

    #[allow(dead_code)]
    struct Frozen;

    impl Tag for Frozen {
        const NAME: &'static str = "test.frozen";
    }

    #[test]
    fn test_component_id_is_stable() {
        assert_eq!(ComponentId::from_name("a"), ComponentId::from_name("a"));
        assert_ne!(ComponentId::from_name("a"), ComponentId::from_name("b"));
        // FNV-1a of the empty string is the offset basis
        assert_eq!(ComponentId::from_name("").raw(), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn test_component_info_of() {
        let info = ComponentInfo::of::<Health>();
        assert_eq!(info.id, Health::ID);
        assert_eq!(info.name, "test.health");
        assert_eq!(info.size, 4);
        assert_eq!(info.alignment, 4);
        assert!(!info.is_tag());
    }

    #[test]
    fn test_tag_info() {
        let info = Frozen::info();
        assert!(info.is_tag());
        assert_eq!(info.alignment, 0);
        assert_eq!(info, ComponentInfo::tag("test.frozen"));
    }
}
