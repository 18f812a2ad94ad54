use itertools::Itertools;

/// Implements `priority_find` for iterators.
pub trait PriorityFind<T> {
    /// Find the item with the best priority, where `0` is the best possible priority.
    ///
    /// The first item at priority `0` ends the search immediately.
    /// Otherwise the first item seen at the best priority encountered is returned.
    fn priority_find<F: Fn(&T) -> usize>(self, prioritize: F) -> Option<T>;
}

impl<T, I> PriorityFind<T> for I
where
    I: Iterator<Item = T>,
{
    fn priority_find<F: Fn(&T) -> usize>(self, prioritize: F) -> Option<T> {
        self.map(|item| (prioritize(&item), item))
            // Stop after the first priority 0 item; nothing can beat it.
            .take_while_inclusive(|(priority, _)| *priority > 0)
            // `min_by_key` keeps the first of equal elements.
            .min_by_key(|(priority, _)| *priority)
            .map(|(_, item)| item)
    }
}
