//! In-memory footprint model
//!
//! Estimates how many bytes a tree component occupies. Used for capacity
//! planning (tree rotation), never as a wire or disk format.

/// Size model of the running platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSizes {
    /// Bytes per pointer / reference
    reference: u64,
    /// Fixed overhead of a heap object (allocation header, reference count, lock word)
    object_header: u64,
    /// Fixed overhead of a heap array (pointer, length, capacity)
    array_header: u64,
}

impl ObjectSizes {
    pub const fn sixty_four_bit() -> Self {
        Self {
            reference: 8,
            object_header: 16,
            array_header: 24,
        }
    }

    pub const fn thirty_two_bit() -> Self {
        Self {
            reference: 4,
            object_header: 8,
            array_header: 12,
        }
    }

    /// Model matching the target the crate is compiled for
    pub fn native() -> Self {
        if std::mem::size_of::<usize>() == 8 {
            Self::sixty_four_bit()
        } else {
            Self::thirty_two_bit()
        }
    }

    pub fn reference_size(&self) -> u64 {
        self.reference
    }

    pub fn object_header(&self) -> u64 {
        self.object_header
    }

    /// Size of a set of primitive fields plus references
    pub fn primitive_types_size(&self, references: u64, bytes: u64, ints: u64, longs: u64) -> u64 {
        references * self.reference + bytes + ints * 4 + longs * 8
    }

    /// Aligned size of an array of `len` elements of `element_size` bytes
    pub fn array_size(&self, len: usize, element_size: u64) -> u64 {
        self.align_to_8(self.array_header + len as u64 * element_size)
    }

    /// Rough size of a hash map holding `entries` entries of `entry_size` bytes
    pub fn hash_map_size(&self, entries: usize, entry_size: u64) -> u64 {
        // Power-of-two bucket count with 7/8 load factor, one control byte per bucket
        let buckets = if entries == 0 {
            0
        } else {
            ((entries as u64 * 8).div_ceil(7)).next_power_of_two()
        };
        self.align_to_8(self.object_header + buckets * (entry_size + 1))
    }

    pub fn align_to_8(&self, size: u64) -> u64 {
        (size + 7) & !7
    }
}

impl Default for ObjectSizes {
    fn default() -> Self {
        Self::native()
    }
}
