//! Shared round-robin partitioning for the fixed-width worker pools the
//! timestamp mirror, CMake rewriter and submodule copier all use.

/// Split `items` into `width` chunks, round-robin by index, for handing one
/// chunk to each thread in a [`std::thread::scope`] pool.
#[must_use]
pub fn partition<T>(items: Vec<T>, width: usize) -> Vec<Vec<T>> {
    let mut chunks: Vec<Vec<T>> = (0..width).map(|_| Vec::new()).collect();
    for (index, item) in items.into_iter().enumerate() {
        if let Some(chunk) = chunks.get_mut(index % width) {
            chunk.push(item);
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributes_items_round_robin() {
        let items: Vec<u32> = (0..10).collect();
        let chunks = partition(items, 3);
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn handles_fewer_items_than_width() {
        let chunks = partition(vec!["a", "b"], 8);
        assert_eq!(chunks.len(), 8);
        assert_eq!(chunks.iter().filter(|chunk| !chunk.is_empty()).count(), 2);
    }
}
