//! Double-buffered pair with one active side

/// Two values of which exactly one is active at any time
#[derive(Debug, Clone)]
pub struct Twins<T> {
    items: [T; 2],
    second_active: bool,
}

impl<T> Twins<T> {
    /// Create a pair; `first` starts active
    pub fn new(first: T, second: T) -> Self {
        Self { items: [first, second], second_active: false }
    }
    
    /// Build both sides with a constructor taking the side index
    pub fn from_fn(mut make: impl FnMut(usize) -> T) -> Self {
        Self::new(make(0), make(1))
    }
    
    /// Index (0 or 1) of the active side
    pub fn active_index(&self) -> usize {
        usize::from(self.second_active)
    }
    
    /// Index (0 or 1) of the inactive side
    pub fn inactive_index(&self) -> usize {
        1 - self.active_index()
    }
    
    /// Active side
    pub fn active(&self) -> &T {
        &self.items[self.active_index()]
    }
    
    /// Inactive side
    pub fn inactive(&self) -> &T {
        &self.items[self.inactive_index()]
    }
    
    /// Mutable inactive side, the only side a producer may write
    pub fn inactive_mut(&mut self) -> &mut T {
        let index = self.inactive_index();
        &mut self.items[index]
    }
    
    /// Make the inactive side active
    pub fn flip(&mut self) {
        self.second_active = !self.second_active;
    }
    
    /// Both sides, in index order
    pub fn both(&self) -> &[T; 2] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_flip_swaps_sides() {
        let mut twins = Twins::new("a", "b");
        assert_eq!(*twins.active(), "a");
        assert_eq!(*twins.inactive(), "b");
        
        twins.flip();
        assert_eq!(*twins.active(), "b");
        assert_eq!(twins.inactive_index(), 0);
    }
    
    #[test]
    fn test_writes_land_on_inactive_side() {
        let mut twins = Twins::from_fn(|_| Vec::new());
        twins.inactive_mut().push(1);
        assert!(twins.active().is_empty());
        
        twins.flip();
        assert_eq!(twins.active(), &vec![1]);
    }
}
