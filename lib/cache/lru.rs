use std::collections::HashMap;
use std::hash::Hash;

const HEAD: usize = 0;

struct Node<K> {
    key: K,
    prev: usize,
    next: usize,
}

impl<K> Node<K>
where
    K: Default + Copy,
{
    fn new(key: K) -> Self {
        Self {
            key,
            prev: HEAD,
            next: HEAD,
        }
    }
}

/// Recency order of keys. The newest key sits right after the sentinel
/// node, the oldest right before it, nodes are linked by slot index.
pub struct LruList<K> {
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    map: HashMap<K, usize>,
}

impl<K> Default for LruList<K>
where
    K: Default + Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LruList<K>
where
    K: Default + Eq + Hash + Copy,
{
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(K::default())],
            free: Vec::new(),
            map: HashMap::new(),
        }
    }

    /// insert `key` as the most recently used, an existing key is moved
    pub fn push_back(&mut self, key: K) {
        if self.move_back(&key) {
            return;
        }
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Node::new(key);
                idx
            }
            None => {
                self.nodes.push(Node::new(key));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.link(idx);
    }

    /// mark `key` as the most recently used, false if it isn't listed
    pub fn move_back(&mut self, key: &K) -> bool {
        match self.map.get(key) {
            None => false,
            Some(&idx) => {
                self.unlink(idx);
                self.link(idx);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            None => false,
            Some(idx) => {
                self.unlink(idx);
                self.free.push(idx);
                true
            }
        }
    }

    /// take the least recently used key
    pub fn pop_front(&mut self) -> Option<K> {
        let idx = self.nodes[HEAD].prev;
        if idx == HEAD {
            return None;
        }
        let key = self.nodes[idx].key;
        self.remove(&key);
        Some(key)
    }

    pub fn front(&self) -> Option<K> {
        let idx = self.nodes[HEAD].prev;
        if idx == HEAD {
            None
        } else {
            Some(self.nodes[idx].key)
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn link(&mut self, idx: usize) {
        let first = self.nodes[HEAD].next;
        self.nodes[idx].next = first;
        self.nodes[idx].prev = HEAD;
        self.nodes[first].prev = idx;
        self.nodes[HEAD].next = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }
}

#[cfg(test)]
mod test {
    use super::LruList;

    #[test]
    fn test_lru() {
        let mut lru = LruList::new();

        lru.push_back(1u64);
        lru.push_back(2);
        lru.push_back(3);
        lru.push_back(4);
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.front(), Some(1));

        assert!(lru.move_back(&1));
        assert!(!lru.move_back(&5));
        assert_eq!(lru.pop_front(), Some(2));

        assert!(lru.remove(&3));
        assert!(!lru.remove(&3));
        assert!(!lru.contains(&3));

        // freed slots are reused
        lru.push_back(5);
        lru.push_back(4);
        assert_eq!(lru.nodes.len(), 5);

        assert_eq!(lru.pop_front(), Some(1));
        assert_eq!(lru.pop_front(), Some(5));
        assert_eq!(lru.pop_front(), Some(4));
        assert_eq!(lru.pop_front(), None);
        assert!(lru.is_empty());
    }
}
