//! Ordered trie traversal

use std::cmp::Ordering;

use super::Trie;

#[derive(Debug, Clone)]
struct Frame {
    /// Next label position to visit
    pos: usize,
    end: usize,
    /// Key length on entering the node, its prefix included
    key_len: usize,
    terminator: Option<usize>,
}

/// Depth-first iterator yielding `(key, value)` in ascending key order
#[derive(Debug, Clone)]
pub struct TrieIter<'a> {
    trie: &'a Trie,
    stack: Vec<Frame>,
    key: Vec<u8>,
}

impl<'a> TrieIter<'a> {
    pub(crate) fn new(trie: &'a Trie) -> Self {
        let mut it = Self::empty(trie);
        if !trie.is_empty() {
            it.enter(0, None);
        }
        it
    }

    pub(crate) fn empty(trie: &'a Trie) -> Self {
        Self {
            trie,
            stack: Vec::new(),
            key: Vec::new(),
        }
    }

    /// Push a frame for `node`, appending its prefix to the key
    fn enter(&mut self, node: usize, pos: Option<usize>) -> &mut Frame {
        self.key.extend_from_slice(self.trie.node_prefix(node));
        let (start, end) = self.trie.node_range(node);
        let terminator = self.trie.is_prefix_key.get(node).then_some(start);
        self.stack.push(Frame {
            pos: pos.unwrap_or(start),
            end,
            key_len: self.key.len(),
            terminator,
        });
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    /// Reposition at the first key `>= target`
    pub fn seek(&mut self, target: &[u8]) {
        self.stack.clear();
        self.key.clear();
        if self.trie.is_empty() {
            return;
        }

        let trie = self.trie;
        let mut node = 0usize;
        let mut depth = 0usize;
        loop {
            let prefix = trie.node_prefix(node);
            let rest = &target[depth..];
            let n = prefix.len().min(rest.len());
            match prefix[..n].cmp(&rest[..n]) {
                // whole subtree sorts before the target
                Ordering::Less => return,
                Ordering::Greater => {
                    self.enter(node, None);
                    return;
                }
                Ordering::Equal if rest.len() < prefix.len() => {
                    self.enter(node, None);
                    return;
                }
                Ordering::Equal => {}
            }
            depth += prefix.len();

            let (start, end) = trie.node_range(node);
            if depth == target.len() {
                self.enter(node, None);
                return;
            }
            let first = trie.first_label(node, start);
            let label = target[depth];
            match trie.search(first, end, label) {
                Some(pos) if trie.has_child.get(pos) => {
                    self.enter(node, Some(pos + 1));
                    self.key.push(label);
                    node = trie.child(pos);
                    depth += 1;
                }
                Some(pos) => {
                    // leaf equal to target only when the target ends here
                    let at = if depth + 1 == target.len() { pos } else { pos + 1 };
                    self.enter(node, Some(at));
                    return;
                }
                None => {
                    let at = trie.search_greater_than(first, end, label).unwrap_or(end);
                    self.enter(node, Some(at));
                    return;
                }
            }
        }
    }
}

impl<'a> Iterator for TrieIter<'a> {
    type Item = (Vec<u8>, u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.pos >= frame.end {
                self.stack.pop();
                continue;
            }
            let pos = frame.pos;
            frame.pos += 1;
            let is_terminator = frame.terminator == Some(pos);
            self.key.truncate(frame.key_len);

            if is_terminator {
                return Some((self.key.clone(), self.trie.value_at(pos)));
            }
            self.key.push(self.trie.labels[pos]);
            if self.trie.has_child.get(pos) {
                let child = self.trie.child(pos);
                self.enter(child, None);
                continue;
            }
            return Some((self.key.clone(), self.trie.value_at(pos)));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::trie::Trie;

    fn trie(keys: &[&str]) -> Trie {
        Trie::from_sorted(keys.iter().enumerate().map(|(i, k)| (k.as_bytes(), i as u32))).unwrap()
    }

    fn keys_from(it: impl Iterator<Item = (Vec<u8>, u32)>) -> Vec<String> {
        it.map(|(k, _)| String::from_utf8(k).unwrap()).collect()
    }

    #[test]
    fn test_iterate_in_order() {
        let keys = ["", "a", "ab", "abc", "abd", "b", "bcd", "host-01", "host-02", "host-10"];
        let t = trie(&keys);
        let got: Vec<(Vec<u8>, u32)> = t.iter().collect();
        assert_eq!(got.len(), keys.len());
        for (i, (k, v)) in got.iter().enumerate() {
            assert_eq!(k.as_slice(), keys[i].as_bytes());
            assert_eq!(*v, i as u32);
        }
    }

    #[test]
    fn test_lower_bound() {
        let keys = ["a", "ab", "abc", "abd", "b", "bcd", "host-01", "host-02", "host-10"];
        let t = trie(&keys);
        let cases: [(&str, Option<&str>); 10] = [
            ("", Some("a")),
            ("a", Some("a")),
            ("aa", Some("ab")),
            ("abc", Some("abc")),
            ("abca", Some("abd")),
            ("abz", Some("b")),
            ("bc", Some("bcd")),
            ("host-", Some("host-01")),
            ("host-03", Some("host-10")),
            ("i", None),
        ];
        for (target, expected) in cases {
            let first = t.lower_bound(target.as_bytes()).next().map(|(k, _)| String::from_utf8(k).unwrap());
            assert_eq!(first.as_deref(), expected, "lower_bound({target:?})");
        }
    }

    #[test]
    fn test_prefix_iter() {
        let keys = ["cpu", "host-01", "host-02", "host-10", "hostname", "memory"];
        let t = trie(&keys);
        assert_eq!(
            keys_from(t.prefix_iter(b"host-")),
            vec!["host-01", "host-02", "host-10"]
        );
        assert_eq!(keys_from(t.prefix_iter(b"host")).len(), 4);
        assert!(keys_from(t.prefix_iter(b"x")).is_empty());
    }
}
