use core::array;
use std::fmt::Debug;
use std::rc::Rc;

use serde::Serialize;
use sha2::{Sha256, Digest};

pub type Hash = [u8; 32];

type Children<V> = [Option<Rc<Node<V>>>; 16];

// Canonical form: a node without a value has either two or more children or,
// for the root of an empty map, none at all. Equal contents give equal commits.
#[derive(Debug, Clone)]
struct Node<V> {
    path: Vec<u8>,
    value: Option<V>,
    children: Option<Children<V>>,
    commit: Hash,
}

impl<V: Serialize + Clone> Node<V> {
    fn new(path: Vec<u8>, value: Option<V>, children: Option<Children<V>>) -> Self {
        let mut node = Node { path, value, children, commit: [0u8; 32] };
        node.commit = node.hash();
        node
    }

    fn empty_children() -> Children<V> {
        array::from_fn(|_| None)
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_none()
    }

    fn prefix_len(a: &[u8], b: &[u8]) -> usize {
        a.iter().zip(b).take_while(|(x, y)| x == y).count()
    }

    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update((self.path.len() as u32).to_be_bytes());
        hasher.update(&self.path);
        match self.value {
            Some(ref v) => {
                hasher.update([1u8]);
                hasher.update(serde_json::to_string(v).expect("can't serialize value"));
            }
            None => hasher.update([0u8]),
        }
        let mut count: u8 = 0;
        if let Some(ref children) = self.children {
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    count += 1;
                    hasher.update([i as u8]);
                    hasher.update(child.commit);
                }
            }
        }
        hasher.update([count]);
        hasher.finalize().into()
    }

    // Branch at `cut_at` (< path length): old contents move into a single child.
    fn split(&self, cut_at: usize) -> Self {
        let child = Self::new(
            self.path[cut_at + 1..].to_vec(),
            self.value.clone(),
            self.children.clone(),
        );
        let mut children = Self::empty_children();
        children[self.path[cut_at] as usize] = Some(Rc::new(child));
        Self::new(self.path[..cut_at].to_vec(), None, Some(children))
    }

    // Absorb a lone child into a valueless node, or clear the path of an empty one.
    fn compact(mut self) -> Self {
        if self.value.is_some() {
            return self;
        }
        let only = match self.children {
            Some(ref children) => {
                let mut some = children.iter().enumerate().filter_map(|(i, c)| c.as_ref().map(|c| (i, c)));
                match (some.next(), some.next()) {
                    (Some((i, child)), None) => Some((i, child.clone())),
                    _ => None,
                }
            }
            None => {
                self.path.clear();
                None
            }
        };
        if let Some((i, child)) = only {
            self.path.push(i as u8);
            self.path.extend_from_slice(&child.path);
            self.value = child.value.clone();
            self.children = child.children.clone();
        }
        self.commit = self.hash();
        self
    }

    fn insert(&self, k: &[u8], v: V) -> (Self, Option<V>) {
        if self.is_empty() {
            return (Self::new(k.to_vec(), Some(v), None), None);
        }
        let cut_at = Self::prefix_len(k, &self.path);
        if cut_at < self.path.len() {
            // Key forks from `path` or ends inside it
            return self.split(cut_at).insert(k, v);
        }
        if k.len() == cut_at {
            // Key is `path`
            let old = self.value.clone();
            return (Self::new(self.path.clone(), Some(v), self.children.clone()), old);
        }
        // Key continues after `path`
        let nibble = k[cut_at] as usize;
        let suffix = &k[cut_at + 1..];
        let mut children = self.children.clone().unwrap_or_else(Self::empty_children);
        let (child, old) = match children[nibble] {
            Some(ref child) => child.insert(suffix, v),
            None => (Self::new(suffix.to_vec(), Some(v), None), None),
        };
        children[nibble] = Some(Rc::new(child));
        (Self::new(self.path.clone(), self.value.clone(), Some(children)), old)
    }

    fn remove(&self, k: &[u8]) -> (Self, Option<V>) {
        let cut_at = Self::prefix_len(k, &self.path);
        if cut_at < self.path.len() {
            return (self.clone(), None);
        }
        if k.len() == cut_at {
            return match self.value {
                Some(ref old) => {
                    let node = Self::new(self.path.clone(), None, self.children.clone()).compact();
                    (node, Some(old.clone()))
                }
                None => (self.clone(), None),
            };
        }
        let nibble = k[cut_at] as usize;
        let child = match self.children {
            Some(ref children) => match children[nibble] {
                Some(ref child) => child.clone(),
                None => return (self.clone(), None),
            },
            None => return (self.clone(), None),
        };
        let (child, old) = child.remove(&k[cut_at + 1..]);
        if old.is_none() {
            return (self.clone(), None);
        }
        let mut children = self.children.clone().unwrap_or_else(Self::empty_children);
        children[nibble] = if child.is_empty() { None } else { Some(Rc::new(child)) };
        let children = if children.iter().all(Option::is_none) { None } else { Some(children) };
        (Self::new(self.path.clone(), self.value.clone(), children).compact(), old)
    }

    fn get(&self, k: &[u8]) -> Option<&V> {
        let cut_at = Self::prefix_len(k, &self.path);
        if cut_at < self.path.len() {
            return None;
        }
        if k.len() == cut_at {
            return self.value.as_ref();
        }
        self.children.as_ref()?[k[cut_at] as usize]
            .as_ref()?
            .get(&k[cut_at + 1..])
    }
}

impl<V: Serialize + Clone> Default for Node<V> {
    fn default() -> Self {
        Self::new(Vec::default(), None, None)
    }
}

/// Depth first, children in nibble order, a node's own value before its children.
pub struct Iter<'a, V> {
    stack: Vec<(&'a Node<V>, Vec<u8>)>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Vec<u8>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((node, mut prefix)) = self.stack.pop() {
            prefix.extend_from_slice(&node.path);
            if let Some(ref children) = node.children {
                for (i, child) in children.iter().enumerate().rev() {
                    if let Some(child) = child {
                        let mut next = prefix.clone();
                        next.push(i as u8);
                        self.stack.push((child, next));
                    }
                }
            }
            if let Some(ref v) = node.value {
                return Some((from_nibbles(&prefix), v));
            }
        }
        None
    }
}

fn to_nibbles(k: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(2 * k.len());
    for byte in k {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

fn from_nibbles(nibbles: &[u8]) -> Vec<u8> {
    nibbles.chunks(2).map(|pair| pair[0] << 4 | pair.get(1).copied().unwrap_or(0)).collect()
}

/// Persistent Merkle map. Cloning is O(1) and clones share every untouched subtree,
/// so a clone doubles as a checkpoint of the map.
#[derive(Debug, Clone)]
pub struct Map<V> {
    root: Rc<Node<V>>,
}

impl<V: Serialize + Clone> Default for Map<V> {
    fn default() -> Self {
        Map { root: Rc::new(Node::default()) }
    }
}

impl<V: Serialize + Clone> Map<V> {
    pub fn insert(&mut self, k: &[u8], v: V) -> Option<V> {
        let (root, old) = self.root.insert(&to_nibbles(k), v);
        self.root = Rc::new(root);
        old
    }

    pub fn remove(&mut self, k: &[u8]) -> Option<V> {
        let (root, old) = self.root.remove(&to_nibbles(k));
        if old.is_some() {
            self.root = Rc::new(root);
        }
        old
    }

    pub fn get(&self, k: &[u8]) -> Option<&V> {
        self.root.get(&to_nibbles(k))
    }

    pub fn commit(&self) -> Hash {
        self.root.commit
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter { stack: Vec::from([(self.root.as_ref(), Vec::new())]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(keys: &[&[u8]]) -> Map<u32> {
        let mut map = Map::default();
        for (i, k) in keys.iter().enumerate() {
            map.insert(k, i as u32);
        }
        map
    }

    #[test]
    fn insert_get() {
        let mut map: Map<u32> = Map::default();
        assert_eq!(map.insert(&[0x01, 0x23], 0), None);
        // Key contained in existing path
        assert_eq!(map.insert(&[0x01], 1), None);
        // Key forks off existing path
        assert_eq!(map.insert(&[0x01, 0x24], 2), None);
        // Key continues past existing path
        assert_eq!(map.insert(&[0x01, 0x23, 0x45], 3), None);
        assert_eq!(map.insert(&[], 4), None);
        // Updates return the old value
        assert_eq!(map.insert(&[0x01], 5), Some(1));
        assert_eq!(map.insert(&[0x01, 0x23], 6), Some(0));

        assert_eq!(map.get(&[0x01]), Some(&5));
        assert_eq!(map.get(&[0x01, 0x23]), Some(&6));
        assert_eq!(map.get(&[0x01, 0x24]), Some(&2));
        assert_eq!(map.get(&[0x01, 0x23, 0x45]), Some(&3));
        assert_eq!(map.get(&[]), Some(&4));
        assert_eq!(map.get(&[0x01, 0x25]), None);
        assert_eq!(map.get(&[0x02]), None);
        assert_eq!(map.get(&[0x01, 0x23, 0x45, 0x67]), None);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn remove() {
        let mut map = map_of(&[&[0x01, 0x23], &[0x01], &[0x01, 0x24], &[0xff]]);
        assert_eq!(map.remove(&[0x01, 0x25]), None);
        assert_eq!(map.remove(&[0x02]), None);
        assert_eq!(map.remove(&[0x01, 0x23]), Some(0));
        assert_eq!(map.remove(&[0x01, 0x23]), None);
        assert_eq!(map.get(&[0x01]), Some(&1));
        assert_eq!(map.get(&[0x01, 0x24]), Some(&2));
        assert_eq!(map.remove(&[0x01]), Some(1));
        assert_eq!(map.remove(&[0x01, 0x24]), Some(2));
        assert_eq!(map.remove(&[0xff]), Some(3));
        assert!(map.is_empty());
        assert_eq!(map.commit(), Map::<u32>::default().commit());
    }

    #[test]
    fn commit_is_canonical() {
        let keys: [&[u8]; 5] = [&[0x12, 0x34], &[0x12], &[0x12, 0x35], &[0x99], &[0x12, 0x34, 0x56]];
        let forward = map_of(&keys);
        let mut backward: Map<u32> = Map::default();
        for (i, k) in keys.iter().enumerate().rev() {
            backward.insert(k, i as u32);
        }
        assert_eq!(forward.commit(), backward.commit());

        // insert then remove lands on the same commit as never inserting
        let mut detour = forward.clone();
        detour.insert(&[0x12, 0x34, 0x57], 9);
        assert_ne!(detour.commit(), forward.commit());
        detour.remove(&[0x12, 0x34, 0x57]);
        assert_eq!(detour.commit(), forward.commit());

        let mut changed = forward.clone();
        changed.insert(&[0x99], 7);
        assert_ne!(changed.commit(), forward.commit());
    }

    #[test]
    fn clone_is_checkpoint() {
        let mut map = map_of(&[&[0x01], &[0x02]]);
        let checkpoint = map.clone();
        map.insert(&[0x03], 2);
        map.remove(&[0x01]);
        assert_eq!(checkpoint.get(&[0x01]), Some(&0));
        assert_eq!(checkpoint.get(&[0x03]), None);
        assert_ne!(checkpoint.commit(), map.commit());
        map = checkpoint.clone();
        assert_eq!(map.commit(), checkpoint.commit());
    }

    #[test]
    fn iter_order() {
        let map = map_of(&[&[0x20], &[0x10, 0x01], &[0x10], &[0x01]]);
        let entries: Vec<(Vec<u8>, u32)> = map.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(entries, Vec::from([
            (vec![0x01], 3),
            (vec![0x10], 2),
            (vec![0x10, 0x01], 1),
            (vec![0x20], 0),
        ]));
    }
}
