use crate::geom::{Aabb, Containment, Frustum};
use crate::store::SplatStore;

const NO_CHILD: u32 = u32::MAX;

#[derive(Debug)]
struct Node {
    bounds: Aabb,
    start: u32,
    end: u32,
    children: [u32; 8],
    leaf: bool,
}

impl Node {
    fn count(&self) -> usize {
        (self.end - self.start) as usize
    }
}

/// Static spatial index over one store snapshot. The build partitions a
/// single splat-index arena in place, so every node's subtree occupies a
/// contiguous range of it; accepting a whole subtree during a frustum
/// query is a single range push. The tree is rebuilt wholesale after
/// structural changes, never mutated splat by splat.
#[derive(Debug)]
pub struct Octree {
    nodes: Vec<Node>,
    indices: Vec<u32>,
    generation: u64,
    max_leaf_size: usize,
    oversized_leaves: usize,
}

impl Octree {
    pub fn build(store: &SplatStore, max_leaf_size: usize, max_depth: u32) -> Self {
        let count = store.total_count();
        let max_leaf_size = max_leaf_size.max(1);
        let mut tree = Self {
            nodes: Vec::new(),
            indices: (0..count as u32).collect(),
            generation: store.generation(),
            max_leaf_size,
            oversized_leaves: 0,
        };
        if count == 0 {
            return tree;
        }

        let bounds = store.bounds();
        let mut scratch = vec![0u32; count];
        tree.nodes.push(Node {
            bounds,
            start: 0,
            end: count as u32,
            children: [NO_CHILD; 8],
            leaf: true,
        });
        tree.subdivide(0, store, 0, max_depth, &mut scratch);
        tracing::debug!(
            splats = count,
            nodes = tree.nodes.len(),
            oversized = tree.oversized_leaves,
            "octree built"
        );
        tree
    }

    fn subdivide(
        &mut self,
        node: usize,
        store: &SplatStore,
        depth: u32,
        max_depth: u32,
        scratch: &mut [u32],
    ) {
        let count = self.nodes[node].count();
        if count <= self.max_leaf_size {
            return;
        }
        if depth >= max_depth {
            // Accept the oversized leaf; culling granularity degrades
            // instead of the build failing.
            self.oversized_leaves += 1;
            return;
        }

        let bounds = self.nodes[node].bounds;
        let start = self.nodes[node].start as usize;
        let end = self.nodes[node].end as usize;

        // Octant counting pass, then a stable scatter through the scratch
        // buffer so each subtree stays contiguous in the arena.
        let mut counts = [0usize; 8];
        for &i in &self.indices[start..end] {
            counts[bounds.octant_of(store.position(i as usize))] += 1;
        }
        let mut offsets = [0usize; 8];
        let mut acc = 0;
        for o in 0..8 {
            offsets[o] = acc;
            acc += counts[o];
        }
        let mut cursors = offsets;
        for &i in &self.indices[start..end] {
            let o = bounds.octant_of(store.position(i as usize));
            scratch[cursors[o]] = i;
            cursors[o] += 1;
        }
        self.indices[start..end].copy_from_slice(&scratch[..count]);

        self.nodes[node].leaf = false;
        for o in 0..8 {
            if counts[o] == 0 {
                continue;
            }
            let child_start = (start + offsets[o]) as u32;
            let child = self.nodes.len();
            self.nodes.push(Node {
                bounds: bounds.octant(o),
                start: child_start,
                end: child_start + counts[o] as u32,
                children: [NO_CHILD; 8],
                leaf: true,
            });
            self.nodes[node].children[o] = child as u32;
            self.subdivide(child, store, depth + 1, max_depth, scratch);
        }
    }

    /// Whether the tree still describes the store it was built over.
    pub fn is_current(&self, store: &SplatStore) -> bool {
        self.generation == store.generation()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn splat_count(&self) -> usize {
        self.indices.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn oversized_leaves(&self) -> usize {
        self.oversized_leaves
    }

    /// Splat-index groups surviving the frustum test. A node outside any
    /// plane is rejected with its whole subtree; a node inside all planes
    /// contributes its full contiguous range without per-splat work.
    /// False positives are possible, false negatives are not.
    pub fn query_frustum(&self, frustum: &Frustum) -> Vec<&[u32]> {
        let mut groups = Vec::new();
        if !self.nodes.is_empty() {
            self.visit(0, frustum, &mut groups);
        }
        groups
    }

    /// `query_frustum` flattened into one candidate list.
    pub fn query_frustum_into(&self, frustum: &Frustum, out: &mut Vec<u32>) {
        out.clear();
        for group in self.query_frustum(frustum) {
            out.extend_from_slice(group);
        }
    }

    fn visit<'a>(&'a self, node: usize, frustum: &Frustum, groups: &mut Vec<&'a [u32]>) {
        let n = &self.nodes[node];
        match frustum.classify(&n.bounds) {
            Containment::Outside => {}
            Containment::Inside => {
                groups.push(&self.indices[n.start as usize..n.end as usize]);
            }
            Containment::Intersects => {
                if n.leaf {
                    groups.push(&self.indices[n.start as usize..n.end as usize]);
                } else {
                    for &child in &n.children {
                        if child != NO_CHILD {
                            self.visit(child as usize, frustum, groups);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SectionData;
    use glam::{Mat4, Vec3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn uniform_store(count: usize, extent: f32, seed: u64) -> SplatStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = SectionData::with_capacity(count, 0);
        for _ in 0..count {
            let p = [
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
            ];
            data.push_splat(p, [0.1; 3], [0.0, 0.0, 0.0, 1.0], [128, 128, 128, 255], &[]);
        }
        let mut store = SplatStore::new(0);
        store.append_section(data).expect("append");
        store
    }

    fn leaves(tree: &Octree) -> Vec<(usize, usize)> {
        (0..tree.nodes.len())
            .filter(|&i| tree.nodes[i].leaf)
            .map(|i| (tree.nodes[i].start as usize, tree.nodes[i].end as usize))
            .collect()
    }

    #[test]
    fn uniform_cube_partitions_exactly_once() {
        let store = uniform_store(1000, 10.0, 7);
        let tree = Octree::build(&store, 16, 10);

        let mut seen = vec![0u32; 1000];
        for (start, end) in leaves(&tree) {
            assert!(end - start <= 16, "leaf over max_leaf_size");
            for &i in &tree.indices[start..end] {
                seen[i as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "each splat in exactly one leaf");
        assert_eq!(tree.oversized_leaves(), 0);
    }

    #[test]
    fn shallow_max_depth_accepts_oversized_leaves() {
        let store = uniform_store(1000, 10.0, 11);
        let tree = Octree::build(&store, 4, 1);
        assert!(tree.oversized_leaves() > 0);
        let total: usize = leaves(&tree).iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn frustum_query_has_no_false_negatives() {
        let store = uniform_store(1000, 10.0, 13);
        let tree = Octree::build(&store, 16, 10);

        let view = Mat4::look_at_rh(Vec3::new(5.0, 5.0, 30.0), Vec3::splat(5.0), Vec3::Y);
        let proj = Mat4::perspective_rh(0.6, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_proj(&(proj * view));

        let mut returned = Vec::new();
        tree.query_frustum_into(&frustum, &mut returned);
        let returned_set: std::collections::HashSet<u32> = returned.iter().copied().collect();
        assert_eq!(returned_set.len(), returned.len(), "no duplicate indices");

        for i in 0..store.total_count() {
            if frustum.contains_point(store.position(i)) {
                assert!(
                    returned_set.contains(&(i as u32)),
                    "splat {} inside the frustum was culled",
                    i
                );
            }
        }

        // Coarse acceptance bounds every false positive by the diagonal of
        // its leaf box: an accepted box intersects the frustum, so none of
        // its points can be farther outside a plane than the box spans.
        let max_diagonal = tree
            .nodes
            .iter()
            .filter(|n| n.leaf)
            .map(|n| (n.bounds.max - n.bounds.min).length())
            .fold(0.0f32, f32::max);
        let expanded = frustum.expanded(max_diagonal + 1e-4);
        for &i in &returned {
            assert!(
                expanded.contains_point(store.position(i as usize)),
                "splat {} returned from a box far outside the frustum",
                i
            );
        }
    }

    #[test]
    fn append_invalidates_the_tree() {
        let mut store = uniform_store(100, 10.0, 17);
        let tree = Octree::build(&store, 16, 10);
        assert!(tree.is_current(&store));

        let mut data = SectionData::with_capacity(1, 0);
        data.push_splat([0.5; 3], [0.1; 3], [0.0, 0.0, 0.0, 1.0], [0, 0, 0, 255], &[]);
        store.append_section(data).expect("append");
        assert!(!tree.is_current(&store));
    }

    #[test]
    fn empty_store_yields_empty_queries() {
        let store = SplatStore::new(0);
        let tree = Octree::build(&store, 16, 10);
        let view = Mat4::look_at_rh(Vec3::Z * 5.0, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(0.6, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_proj(&(proj * view));
        assert!(tree.query_frustum(&frustum).is_empty());
    }
}
