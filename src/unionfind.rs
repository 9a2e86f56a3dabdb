//! Arena union-find over integer indices.
//!
//! Parent/rank vectors instead of map-based parent pointers: no hashing on
//! the hot path, and `find` self-heals path compression on every call.

pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut r = x;
        while self.parent[r] != r {
            r = self.parent[r];
        }
        // Path compression
        let mut c = x;
        while self.parent[c] != r {
            let next = self.parent[c];
            self.parent[c] = r;
            c = next;
        }
        r
    }

    /// Union by rank. Returns false when the two were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    pub fn same(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Group members by root. Singleton groups are included.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let n = self.len();
        let mut by_root: std::collections::HashMap<usize, Vec<usize>> =
            std::collections::HashMap::new();
        for i in 0..n {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_joins() {
        let mut uf = UnionFind::new(4);
        assert!(uf.union(0, 1));
        assert!(uf.same(0, 1));
        assert!(!uf.same(0, 2));
        assert!(!uf.union(1, 0));
    }

    #[test]
    fn compression_preserves_partition() {
        let mut uf = UnionFind::new(6);
        uf.union(0, 1);
        uf.union(1, 2);
        uf.union(3, 4);
        let before: Vec<usize> = (0..6).map(|i| uf.find(i)).collect();
        // Repeated finds compress paths but must not change the partition.
        for _ in 0..3 {
            let after: Vec<usize> = (0..6).map(|i| uf.find(i)).collect();
            assert_eq!(before, after);
        }
        assert!(uf.same(0, 2));
        assert!(uf.same(3, 4));
        assert!(!uf.same(2, 3));
        assert!(!uf.same(4, 5));
    }

    #[test]
    fn groups_cover_all_indices() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 4);
        uf.union(1, 2);
        let groups = uf.groups();
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, 5);
        assert_eq!(groups.len(), 3);
    }
}
