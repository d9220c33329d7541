/// Split bookkeeping for one arena node.
///
/// `left_child == 0` marks a leaf: node 0 is the root, which can never be
/// anyone's child, so 0 is free to act as the sentinel. A split node's
/// right child always sits at `left_child + 1` because children are
/// appended in pairs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    depth: u32,
    left_child: usize,
    split_feature: usize,
    threshold: f32,
}

impl NodeConfig {
    fn leaf(depth: u32) -> Self {
        Self {
            depth,
            left_child: 0,
            split_feature: 0,
            threshold: 0.0,
        }
    }

    /// Return the depth of this node (the root has depth 0).
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Return `true` when this node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.left_child == 0
    }

    /// Return the arena index of the left child.
    #[must_use]
    pub fn left_child(&self) -> usize {
        self.left_child
    }

    /// Return the arena index of the right child.
    #[must_use]
    pub fn right_child(&self) -> usize {
        self.left_child + 1
    }

    /// Return the feature this node thresholds on.
    #[must_use]
    pub fn split_feature(&self) -> usize {
        self.split_feature
    }

    /// Return the split threshold.
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// The payload a classification tree keeps at each node.
pub trait LeafModel {
    /// The per-class log-posterior stored at this node.
    fn log_histogram(&self) -> &[f32];
}

/// Leaf payload of an offline-trained classification tree.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LeafData {
    /// Smoothed per-class log-posterior.
    pub histogram: Vec<f32>,
}

impl LeafModel for LeafData {
    fn log_histogram(&self) -> &[f32] {
        &self.histogram
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TreeNode<D> {
    config: NodeConfig,
    data: D,
}

/// An arena-allocated binary decision tree with per-node payload `D`.
///
/// Nodes live in a growable array and reference children by index. The
/// tree starts with a root leaf and only ever grows: [`Tree::split`]
/// appends both children of a node in one step. Stored alongside the
/// nodes is the dimensionality the tree was trained on, used to validate
/// prediction inputs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tree<D> {
    nodes: Vec<TreeNode<D>>,
    dimensionality: usize,
}

/// A classification tree storing smoothed log-posteriors at its leaves.
pub type DecisionTree = Tree<LeafData>;

impl<D: Default> Tree<D> {
    /// Create a tree consisting of a single root leaf.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode {
                config: NodeConfig::leaf(0),
                data: D::default(),
            }],
            dimensionality: 0,
        }
    }

    /// Append a fresh unsplit node at depth 0 with a default payload and
    /// return its arena index. The node is unattached until some split
    /// names it as a child; [`Tree::split`] is the usual growth path.
    pub fn add_node(&mut self) -> usize {
        self.nodes.push(TreeNode {
            config: NodeConfig::leaf(0),
            data: D::default(),
        });
        self.nodes.len() - 1
    }

    /// Turn the leaf `node` into a split on `feature` at `threshold` and
    /// append its two children. Returns the arena index of the left child;
    /// the right child is that index plus one.
    ///
    /// # Panics
    ///
    /// Panics when `node` is out of bounds or is not a leaf.
    pub fn split(&mut self, node: usize, feature: usize, threshold: f32) -> usize {
        assert!(node < self.nodes.len(), "node {node} out of bounds");
        assert!(
            self.nodes[node].config.is_leaf(),
            "node {node} is already split"
        );
        let left = self.nodes.len();
        let child_depth = self.nodes[node].config.depth + 1;
        self.nodes[node].config.left_child = left;
        self.nodes[node].config.split_feature = feature;
        self.nodes[node].config.threshold = threshold;
        self.nodes.push(TreeNode {
            config: NodeConfig::leaf(child_depth),
            data: D::default(),
        });
        self.nodes.push(TreeNode {
            config: NodeConfig::leaf(child_depth),
            data: D::default(),
        });
        left
    }
}

impl<D: Default> Default for Tree<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Tree<D> {
    /// Return the number of nodes (splits and leaves).
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Return the number of leaves.
    #[must_use]
    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.config.is_leaf()).count()
    }

    /// Return the depth of the deepest node.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| n.config.depth)
            .max()
            .unwrap_or(0)
    }

    /// Return the dimensionality this tree validates inputs against.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    /// Record the dimensionality of the training data.
    pub fn set_dimensionality(&mut self, dimensionality: usize) {
        self.dimensionality = dimensionality;
    }

    /// Return the split bookkeeping of `node`.
    #[must_use]
    pub fn config(&self, node: usize) -> &NodeConfig {
        &self.nodes[node].config
    }

    /// Return the payload of `node`.
    #[must_use]
    pub fn data(&self, node: usize) -> &D {
        &self.nodes[node].data
    }

    /// Return the payload of `node` mutably.
    pub fn data_mut(&mut self, node: usize) -> &mut D {
        &mut self.nodes[node].data
    }

    /// Route `point` from the root to a leaf and return that leaf's index.
    ///
    /// At each split the point goes left when its value on the split
    /// feature is strictly below the threshold, right otherwise.
    #[must_use]
    pub fn route(&self, point: &[f32]) -> usize {
        let mut node = 0;
        loop {
            let config = &self.nodes[node].config;
            if config.is_leaf() {
                return node;
            }
            node = if point[config.split_feature()] < config.threshold() {
                config.left_child()
            } else {
                config.right_child()
            };
        }
    }

    /// Iterate over the arena indices of all leaves.
    pub fn leaf_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.config.is_leaf())
            .map(|(i, _)| i)
    }
}
