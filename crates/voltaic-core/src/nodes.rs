//! MNA unknown allocation.
//!
//! Every unknown of the modified nodal formulation gets a contiguous integer
//! index from a [`NodeMap`]: index 0 is ground (forced to 0 V and omitted
//! from the solve), indices >= 1 are node voltages or branch currents.
//!
//! External nodes come from the netlist and survive [`NodeMap::reset`];
//! internal nodes (a BJT's collector-prime, a voltage source's branch
//! current) are created lazily during device setup and are released on
//! reset so a fresh setup reallocates them identically.

use indexmap::IndexMap;

/// What an MNA index stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKind {
    /// A node voltage.
    Voltage,
    /// A branch current (voltage sources, inductors, VCVS/CCVS outputs).
    Current,
}

/// Allocates and tracks MNA row/column indices.
#[derive(Debug, Clone)]
pub struct NodeMap {
    names: IndexMap<String, usize>,
    kinds: Vec<UnknownKind>,
    /// Indices below this were supplied by the netlist and survive `reset`.
    external: usize,
}

impl NodeMap {
    /// Create a map containing only ground.
    pub fn new() -> Self {
        let mut names = IndexMap::new();
        names.insert("0".to_string(), 0);
        Self {
            names,
            kinds: vec![UnknownKind::Voltage],
            external: 1,
        }
    }

    /// The ground index.
    #[inline]
    pub fn ground(&self) -> usize {
        0
    }

    /// Total number of indices, ground included.
    #[inline]
    pub fn count(&self) -> usize {
        self.kinds.len()
    }

    /// Number of unknowns actually solved for (ground excluded).
    #[inline]
    pub fn unknowns(&self) -> usize {
        self.kinds.len() - 1
    }

    /// Get or create the voltage node with the given name.
    ///
    /// The netlist ground aliases ("0", "gnd") map to index 0.
    pub fn create(&mut self, name: &str) -> usize {
        if name.eq_ignore_ascii_case("gnd") {
            return 0;
        }
        if let Some(&idx) = self.names.get(name) {
            return idx;
        }
        self.insert(name.to_string(), UnknownKind::Voltage)
    }

    /// Create an internal node owned by a device, named `owner#suffix`.
    ///
    /// Re-creating the same internal node returns the existing index, which
    /// keeps setup idempotent after an unsetup/reset cycle.
    pub fn create_internal(&mut self, owner: &str, suffix: &str) -> usize {
        let name = format!("{owner}#{suffix}");
        if let Some(&idx) = self.names.get(&name) {
            return idx;
        }
        self.insert(name, UnknownKind::Voltage)
    }

    /// Create a branch-current unknown named `owner#branch`.
    pub fn create_branch(&mut self, owner: &str) -> usize {
        let name = format!("{owner}#branch");
        if let Some(&idx) = self.names.get(&name) {
            return idx;
        }
        self.insert(name, UnknownKind::Current)
    }

    fn insert(&mut self, name: String, kind: UnknownKind) -> usize {
        let idx = self.kinds.len();
        self.names.insert(name, idx);
        self.kinds.push(kind);
        idx
    }

    /// Mark every index allocated so far as external.
    ///
    /// Called once after the netlist-visible nodes have been bound and
    /// before device setup creates internal unknowns.
    pub fn freeze_external(&mut self) {
        self.external = self.kinds.len();
    }

    /// Release all internal indices, preserving the external ones.
    pub fn reset(&mut self) {
        self.names.truncate(self.external);
        self.kinds.truncate(self.external);
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Look up a name by index.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names
            .get_index(index)
            .map(|(name, _)| name.as_str())
    }

    /// The kind of unknown behind an index.
    pub fn kind(&self, index: usize) -> Option<UnknownKind> {
        self.kinds.get(index).copied()
    }

    /// Whether the index is device-internal (released on reset).
    pub fn is_internal(&self, index: usize) -> bool {
        index >= self.external
    }

    /// Iterate `(name, index)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.names.iter().map(|(name, &idx)| (name.as_str(), idx))
    }
}

impl Default for NodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_is_zero() {
        let mut nodes = NodeMap::new();
        assert_eq!(nodes.ground(), 0);
        assert_eq!(nodes.create("0"), 0);
        assert_eq!(nodes.create("GND"), 0);
        assert_eq!(nodes.count(), 1);
    }

    #[test]
    fn indices_are_contiguous_and_stable() {
        let mut nodes = NodeMap::new();
        let a = nodes.create("in");
        let b = nodes.create("out");
        assert_eq!((a, b), (1, 2));
        assert_eq!(nodes.create("in"), 1);
        assert_eq!(nodes.index("out"), Some(2));
        assert_eq!(nodes.name(2), Some("out"));
    }

    #[test]
    fn reset_releases_internal_only() {
        let mut nodes = NodeMap::new();
        nodes.create("in");
        nodes.create("out");
        nodes.freeze_external();

        let col = nodes.create_internal("Q1", "col");
        let br = nodes.create_branch("V1");
        assert_eq!(nodes.name(col), Some("Q1#col"));
        assert_eq!(nodes.kind(br), Some(UnknownKind::Current));
        assert!(nodes.is_internal(col));
        assert_eq!(nodes.count(), 5);

        nodes.reset();
        assert_eq!(nodes.count(), 3);
        assert_eq!(nodes.index("Q1#col"), None);
        assert_eq!(nodes.index("out"), Some(2));

        // re-setup allocates the same indices again
        assert_eq!(nodes.create_internal("Q1", "col"), col);
        assert_eq!(nodes.create_branch("V1"), br);
    }
}
