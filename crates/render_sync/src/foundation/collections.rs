//! Specialized collection types
//!
//! Bounded pools in this crate hand out plain indices. Each pool gets its own
//! index newtype so an instance index can never be used to address a node.

use std::fmt;

const WORD_BITS: usize = 64;

/// Fixed-capacity bitmap allocator
///
/// `allocate` always returns the lowest free slot. The table is not
/// synchronized; share it behind a `Mutex` when several threads allocate.
#[derive(Clone)]
pub struct FreeSlotTable {
    words: Vec<u64>,
    capacity: usize,
    taken: usize,
}

impl FreeSlotTable {
    /// Create a table with `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
            taken: 0,
        }
    }
    
    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    
    /// Number of slots currently taken
    pub fn len(&self) -> usize {
        self.taken
    }
    
    /// Check if no slot is taken
    pub fn is_empty(&self) -> bool {
        self.taken == 0
    }
    
    /// Check if every slot is taken
    pub fn is_full(&self) -> bool {
        self.taken == self.capacity
    }
    
    /// Take the lowest free slot, or `None` when the table is full
    pub fn allocate(&mut self) -> Option<usize> {
        let index = self.find_first_free()?;
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        self.taken += 1;
        Some(index)
    }
    
    /// Return a slot to the pool
    ///
    /// # Panics
    /// Freeing a slot that is not taken is a caller bug.
    pub fn free(&mut self, index: usize) {
        assert!(index < self.capacity, "slot {index} out of range (capacity {})", self.capacity);
        let mask = 1u64 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        assert!(*word & mask != 0, "double free of slot {index}");
        *word &= !mask;
        self.taken -= 1;
    }
    
    /// Check whether a slot is taken
    pub fn is_taken(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }
    
    /// Lowest free slot, if any
    pub fn find_first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * WORD_BITS + (!word).trailing_zeros() as usize)
            .filter(|index| *index < self.capacity)
    }
    
    /// Lowest taken slot at or after `start`
    pub fn find_next_taken(&self, start: usize) -> Option<usize> {
        if start >= self.capacity {
            return None;
        }
        
        let first_word = start / WORD_BITS;
        let head = self.words[first_word] & (u64::MAX << (start % WORD_BITS));
        if head != 0 {
            return Some(first_word * WORD_BITS + head.trailing_zeros() as usize);
        }
        
        self.words[first_word + 1..]
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| (first_word + 1 + i) * WORD_BITS + word.trailing_zeros() as usize)
    }
    
    /// Highest taken slot, if any
    pub fn find_last_taken(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| i * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros() as usize))
    }
    
    /// Iterate over all taken slots in ascending order
    pub fn iter_taken(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.find_next_taken(0);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.find_next_taken(current + 1);
            Some(current)
        })
    }
    
    /// Free every slot
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.taken = 0;
    }
}

impl fmt::Debug for FreeSlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeSlotTable")
            .field("capacity", &self.capacity)
            .field("taken", &self.taken)
            .finish()
    }
}

macro_rules! pool_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);
        
        impl $name {
            /// Wrap a raw pool index
            pub fn new(index: usize) -> Self {
                Self(u32::try_from(index).unwrap_or(u32::MAX))
            }
            
            /// Raw pool index
            pub fn index(self) -> usize {
                self.0 as usize
            }
            
            /// Index as stored in GPU records
            pub fn raw(self) -> u32 {
                self.0
            }
        }
        
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

pool_index!(
    /// Index into the scene instance pool
    InstanceId
);
pool_index!(
    /// Index into the spatial node table
    NodeId
);
pool_index!(
    /// Index into the mesh table
    MeshSlot
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    
    #[test]
    fn test_allocate_lowest_first() {
        let mut table = FreeSlotTable::with_capacity(8);
        assert_eq!(table.allocate(), Some(0));
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(2));
        
        table.free(1);
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.len(), 3);
    }
    
    #[test]
    fn test_full_table_returns_none() {
        let mut table = FreeSlotTable::with_capacity(3);
        for _ in 0..3 {
            assert!(table.allocate().is_some());
        }
        assert!(table.is_full());
        assert_eq!(table.allocate(), None);
        assert_eq!(table.find_first_free(), None);
    }
    
    #[test]
    fn test_capacity_across_words() {
        let mut table = FreeSlotTable::with_capacity(130);
        for expected in 0..130 {
            assert_eq!(table.allocate(), Some(expected));
        }
        assert_eq!(table.allocate(), None);
        
        table.free(65);
        table.free(129);
        assert_eq!(table.find_first_free(), Some(65));
        assert_eq!(table.find_last_taken(), Some(128));
    }
    
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut table = FreeSlotTable::with_capacity(4);
        let slot = table.allocate().unwrap();
        table.free(slot);
        table.free(slot);
    }
    
    #[test]
    fn test_find_next_taken() {
        let mut table = FreeSlotTable::with_capacity(200);
        for _ in 0..200 {
            table.allocate();
        }
        for index in 0..200 {
            if ![3, 70, 199].contains(&index) {
                table.free(index);
            }
        }
        
        assert_eq!(table.find_next_taken(0), Some(3));
        assert_eq!(table.find_next_taken(3), Some(3));
        assert_eq!(table.find_next_taken(4), Some(70));
        assert_eq!(table.find_next_taken(71), Some(199));
        assert_eq!(table.find_next_taken(200), None);
        assert_eq!(table.iter_taken().collect::<Vec<_>>(), vec![3, 70, 199]);
    }
    
    #[test]
    fn test_live_allocations_never_alias() {
        let mut table = FreeSlotTable::with_capacity(64);
        let mut live = HashSet::new();
        
        // Deterministic interleaving of allocations and frees
        let mut state = 0x2545_f491_u32;
        for _ in 0..2000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            
            if state % 3 != 0 && !table.is_full() {
                let slot = table.allocate().unwrap();
                assert!(live.insert(slot), "slot {slot} handed out twice");
            } else if let Some(&slot) = live.iter().next() {
                live.remove(&slot);
                table.free(slot);
            }
            assert_eq!(table.len(), live.len());
        }
    }
    
    #[test]
    fn test_index_newtypes() {
        let node = NodeId::new(7);
        assert_eq!(node.index(), 7);
        assert_eq!(node.raw(), 7);
        assert_eq!(node.to_string(), "NodeId#7");
    }
}
