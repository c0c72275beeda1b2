//! Order-preserving forward-line deduplication.

use indexmap::IndexSet;

use super::model::{ForwardNode, FORWARD_PREFIX};

/// Keep the first occurrence of every distinct raw line, in first-seen order.
/// Lines without the `forward=` marker are dropped.
pub fn dedupe_forwards<I>(nodes: I) -> Vec<ForwardNode>
where
    I: IntoIterator<Item = ForwardNode>,
{
    let set: IndexSet<ForwardNode> = nodes
        .into_iter()
        .filter(|node| node.raw().starts_with(FORWARD_PREFIX))
        .collect();
    set.into_iter().collect()
}
