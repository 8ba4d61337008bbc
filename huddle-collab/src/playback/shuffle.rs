use rand::{seq::SliceRandom, thread_rng};

/// A derived play order over queue indices.
///
/// Seeded once when shuffle is enabled and kept stable afterwards, so
/// skipping through the queue walks one fixed permutation instead of
/// re-randomizing per step. The underlying queue order is untouched.
#[derive(Debug, Clone)]
pub struct ShuffleOrder {
    order: Vec<usize>,
}

impl ShuffleOrder {
    pub fn new(queue_len: usize) -> Self {
        let mut order: Vec<usize> = (0..queue_len).collect();
        order.shuffle(&mut thread_rng());

        Self { order }
    }

    #[cfg(test)]
    pub fn from_order(order: Vec<usize>) -> Self {
        Self { order }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The position of a queue index within the play order
    pub fn position_of(&self, index: usize) -> Option<usize> {
        self.order.iter().position(|&i| i == index)
    }

    /// The queue index at a position of the play order
    pub fn index_at(&self, position: usize) -> Option<usize> {
        self.order.get(position).copied()
    }

    /// Appends a newly added queue index to the end of the play order
    pub fn push(&mut self, index: usize) {
        self.order.push(index);
    }

    /// Removes a queue index from the play order and shifts the indices
    /// above it down, mirroring a removal from the queue itself
    pub fn remove(&mut self, index: usize) {
        self.order.retain(|&i| i != index);

        for i in self.order.iter_mut() {
            if *i > index {
                *i -= 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn order_is_a_permutation() {
        let order = ShuffleOrder::new(8);

        let mut seen: Vec<_> = (0..8).filter_map(|p| order.index_at(p)).collect();
        seen.sort();

        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn removal_shifts_higher_indices() {
        let mut order = ShuffleOrder::from_order(vec![2, 0, 3, 1]);

        order.remove(1);

        // 2 and 3 shift down by one, 0 stays
        assert_eq!(order.index_at(0), Some(1));
        assert_eq!(order.index_at(1), Some(0));
        assert_eq!(order.index_at(2), Some(2));
        assert_eq!(order.len(), 3);
    }
}
