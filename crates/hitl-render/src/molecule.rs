//! Molecular graph.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Quadruple,
    Aromatic,
}

impl BondOrder {
    /// Number of strokes used to depict the bond.
    pub fn strokes(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Double | Self::Aromatic => 2,
            Self::Triple | Self::Quadruple => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Element symbol with canonical capitalisation ("C", "Cl", ...).
    pub symbol: String,
    pub aromatic: bool,
    pub charge: i8,
    /// Explicit hydrogen count from a bracket atom.
    pub hydrogens: Option<u8>,
    pub isotope: Option<u16>,
    pub class: Option<u32>,
}

impl Atom {
    pub fn new(symbol: impl Into<String>, aromatic: bool) -> Self {
        Self {
            symbol: symbol.into(),
            aromatic,
            charge: 0,
            hydrogens: None,
            isotope: None,
            class: None,
        }
    }

    pub fn is_carbon(&self) -> bool {
        self.symbol == "C"
    }

    /// CPK-style depiction colour.
    pub fn color(&self) -> (u8, u8, u8) {
        match self.symbol.as_str() {
            "C" => (0, 0, 0),
            "N" => (33, 33, 255),
            "O" => (255, 13, 13),
            "F" | "Cl" => (31, 240, 31),
            "Br" => (166, 41, 41),
            "I" => (148, 0, 148),
            "S" => (204, 204, 0),
            "P" => (255, 128, 0),
            "B" => (255, 181, 181),
            _ => (128, 128, 128),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bond {
    pub begin: usize,
    pub end: usize,
    pub order: BondOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
}

impl Molecule {
    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn bond_count(&self) -> usize {
        self.bonds.len()
    }

    pub fn neighbors(&self, atom: usize) -> impl Iterator<Item = usize> + '_ {
        self.bonds.iter().filter_map(move |b| {
            if b.begin == atom {
                Some(b.end)
            } else if b.end == atom {
                Some(b.begin)
            } else {
                None
            }
        })
    }

    pub fn are_bonded(&self, a: usize, b: usize) -> bool {
        self.bonds
            .iter()
            .any(|bond| (bond.begin == a && bond.end == b) || (bond.begin == b && bond.end == a))
    }

    pub(crate) fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.atoms.len() - 1
    }

    pub(crate) fn add_bond(&mut self, begin: usize, end: usize, order: BondOrder) {
        self.bonds.push(Bond { begin, end, order });
    }

    /// All-pairs shortest path lengths in bonds; `None` between fragments.
    pub fn topological_distances(&self) -> Vec<Vec<Option<usize>>> {
        let n = self.atom_count();
        let mut adjacency = vec![Vec::new(); n];
        for bond in &self.bonds {
            adjacency[bond.begin].push(bond.end);
            adjacency[bond.end].push(bond.begin);
        }

        let mut distances = vec![vec![None; n]; n];
        let mut queue = std::collections::VecDeque::new();
        for source in 0..n {
            let row = &mut distances[source];
            row[source] = Some(0);
            queue.push_back(source);
            while let Some(atom) = queue.pop_front() {
                let next = row[atom].unwrap_or(0) + 1;
                for &neighbor in &adjacency[atom] {
                    if row[neighbor].is_none() {
                        row[neighbor] = Some(next);
                        queue.push_back(neighbor);
                    }
                }
            }
        }
        distances
    }
}
