//! Single-pass, non-restartable depth-first iteration.
//!
//! An explicit stack of `(node, position)` frames stands in for recursion;
//! depth never exceeds [`super::MAX_DEPTH`]. Each yielded item carries the
//! domain id of the node it was found in, so callers doing cross-domain
//! adoption can tell locally-owned entries from foreign ones without a
//! second lookup.

use std::sync::Arc;

use crate::domain::DomainId;
use crate::value::Value;

use super::node::{Node, Slot};

pub(crate) struct Iter {
    stack: Vec<(Arc<Node>, usize)>,
}

impl Iter {
    pub(crate) fn new(root: Option<Arc<Node>>) -> Self {
        let mut stack = Vec::with_capacity(super::MAX_DEPTH as usize);
        if let Some(root) = root {
            stack.push((root, 0));
        }
        Iter { stack }
    }
}

impl Iterator for Iter {
    type Item = (DomainId, Value, Value);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, idx) = match self.stack.last() {
                Some((node, pos)) => (Arc::clone(node), *pos),
                None => return None,
            };
            match node.as_ref() {
                Node::Bitmap(b) => {
                    if idx >= b.slots.len() {
                        self.stack.pop();
                        continue;
                    }
                    self.stack.last_mut().unwrap().1 += 1;
                    match &b.slots[idx] {
                        Slot::Leaf(k, v) => return Some((b.header.domain, k.clone(), v.clone())),
                        Slot::Child(c) => self.stack.push((Arc::clone(c), 0)),
                    }
                }
                Node::Array(a) => {
                    if idx >= a.children.len() {
                        self.stack.pop();
                        continue;
                    }
                    self.stack.last_mut().unwrap().1 += 1;
                    if let Some(c) = &a.children[idx] {
                        self.stack.push((Arc::clone(c), 0));
                    }
                }
                Node::Collision(c) => {
                    if idx >= c.pairs.len() {
                        self.stack.pop();
                        continue;
                    }
                    self.stack.last_mut().unwrap().1 += 1;
                    let (k, v) = &c.pairs[idx];
                    return Some((c.header.domain, k.clone(), v.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamt::node::assoc;
    use std::collections::HashSet;

    #[test]
    fn yields_every_inserted_key_exactly_once() {
        let domain = DomainId::next();
        let mut root = None;
        for i in 0..40u32 {
            root = Some(assoc(root, i, Value::Int(i as i64), Value::Int(i as i64), 0, 0, domain).unwrap());
        }
        let seen: HashSet<i64> = Iter::new(root)
            .map(|(_, k, _)| match k {
                Value::Int(n) => n,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seen.len(), 40);
        for i in 0..40i64 {
            assert!(seen.contains(&i));
        }
    }
}
