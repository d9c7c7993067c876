//! SMILES reader.
//!
//! Supports the organic subset, bracket atoms, bond symbols, branches, ring
//! closures (`1`..`9`, `%nn`) and dot-disconnected fragments. Stereo marks are
//! accepted and dropped; they do not affect a 2-D depiction.

use hitl_types::RenderError;
use std::collections::HashMap;

use crate::molecule::{Atom, BondOrder, Molecule};

/// Parse a SMILES string into a molecular graph.
pub fn parse(input: &str) -> Result<Molecule, RenderError> {
    Parser::new(input).run()
}

fn error(position: usize, message: impl Into<String>) -> RenderError {
    RenderError::Smiles {
        position,
        message: message.into(),
    }
}

struct RingBond {
    atom: usize,
    order: Option<BondOrder>,
    position: usize,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    molecule: Molecule,
    previous: Option<usize>,
    pending_bond: Option<(BondOrder, usize)>,
    branches: Vec<(usize, usize)>,
    rings: HashMap<u32, RingBond>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
            molecule: Molecule::default(),
            previous: None,
            pending_bond: None,
            branches: Vec::new(),
            rings: HashMap::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<Molecule, RenderError> {
        if self.bytes.is_empty() {
            return Err(error(0, "empty SMILES"));
        }

        while let Some(c) = self.peek() {
            match c {
                b'(' => self.open_branch()?,
                b')' => self.close_branch()?,
                b'-' | b'=' | b'#' | b':' | b'$' | b'/' | b'\\' => self.bond_symbol(c)?,
                b'.' => {
                    if let Some((_, at)) = self.pending_bond {
                        return Err(error(at, "bond before '.'"));
                    }
                    self.previous = None;
                    self.pos += 1;
                }
                b'0'..=b'9' | b'%' => self.ring_closure()?,
                b'[' => self.bracket_atom()?,
                b'A'..=b'Z' | b'a'..=b'z' | b'*' => self.organic_atom()?,
                _ => {
                    return Err(error(
                        self.pos,
                        format!("unexpected character '{}'", char::from(c)),
                    ))
                }
            }
        }

        if let Some((_, at)) = self.pending_bond {
            return Err(error(at, "dangling bond"));
        }
        if let Some(&(_, at)) = self.branches.last() {
            return Err(error(at, "unclosed branch"));
        }
        if let Some(ring) = self.rings.values().min_by_key(|r| r.position) {
            return Err(error(ring.position, "unclosed ring"));
        }
        Ok(self.molecule)
    }

    fn open_branch(&mut self) -> Result<(), RenderError> {
        let Some(previous) = self.previous else {
            return Err(error(self.pos, "branch without a preceding atom"));
        };
        if let Some((_, at)) = self.pending_bond {
            return Err(error(at, "bond before branch"));
        }
        self.branches.push((previous, self.pos));
        self.pos += 1;
        Ok(())
    }

    fn close_branch(&mut self) -> Result<(), RenderError> {
        if let Some((_, at)) = self.pending_bond {
            return Err(error(at, "dangling bond"));
        }
        let Some((anchor, _)) = self.branches.pop() else {
            return Err(error(self.pos, "unmatched ')'"));
        };
        self.previous = Some(anchor);
        self.pos += 1;
        Ok(())
    }

    fn bond_symbol(&mut self, c: u8) -> Result<(), RenderError> {
        if self.pending_bond.is_some() {
            return Err(error(self.pos, "consecutive bond symbols"));
        }
        let order = match c {
            b'=' => BondOrder::Double,
            b'#' => BondOrder::Triple,
            b'$' => BondOrder::Quadruple,
            b':' => BondOrder::Aromatic,
            _ => BondOrder::Single,
        };
        self.pending_bond = Some((order, self.pos));
        self.pos += 1;
        Ok(())
    }

    fn default_order(&self, a: usize, b: usize) -> BondOrder {
        if self.molecule.atoms[a].aromatic && self.molecule.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        }
    }

    fn ring_closure(&mut self) -> Result<(), RenderError> {
        let start = self.pos;
        let Some(previous) = self.previous else {
            return Err(error(start, "ring bond without a preceding atom"));
        };

        let label = if self.peek() == Some(b'%') {
            match (self.peek_at(1), self.peek_at(2)) {
                (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit() => {
                    self.pos += 3;
                    u32::from(a - b'0') * 10 + u32::from(b - b'0')
                }
                _ => return Err(error(start, "expected two digits after '%'")),
            }
        } else {
            let digit = u32::from(self.bytes[start] - b'0');
            self.pos += 1;
            digit
        };

        let explicit = self.pending_bond.take().map(|(order, _)| order);
        match self.rings.remove(&label) {
            Some(open) => {
                if open.atom == previous {
                    return Err(error(start, "ring closes on the same atom"));
                }
                if self.molecule.are_bonded(open.atom, previous) {
                    return Err(error(start, "ring closure duplicates an existing bond"));
                }
                let order = match (explicit, open.order) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(error(start, "conflicting ring bond orders"))
                    }
                    (Some(order), _) | (None, Some(order)) => order,
                    (None, None) => self.default_order(open.atom, previous),
                };
                self.molecule.add_bond(open.atom, previous, order);
            }
            None => {
                self.rings.insert(
                    label,
                    RingBond {
                        atom: previous,
                        order: explicit,
                        position: start,
                    },
                );
            }
        }
        Ok(())
    }

    fn organic_atom(&mut self) -> Result<(), RenderError> {
        let start = self.pos;
        let (symbol, aromatic, width) = match (self.peek(), self.peek_at(1)) {
            (Some(b'C'), Some(b'l')) => ("Cl", false, 2),
            (Some(b'B'), Some(b'r')) => ("Br", false, 2),
            (Some(b'B'), _) => ("B", false, 1),
            (Some(b'C'), _) => ("C", false, 1),
            (Some(b'N'), _) => ("N", false, 1),
            (Some(b'O'), _) => ("O", false, 1),
            (Some(b'P'), _) => ("P", false, 1),
            (Some(b'S'), _) => ("S", false, 1),
            (Some(b'F'), _) => ("F", false, 1),
            (Some(b'I'), _) => ("I", false, 1),
            (Some(b'b'), _) => ("B", true, 1),
            (Some(b'c'), _) => ("C", true, 1),
            (Some(b'n'), _) => ("N", true, 1),
            (Some(b'o'), _) => ("O", true, 1),
            (Some(b'p'), _) => ("P", true, 1),
            (Some(b's'), _) => ("S", true, 1),
            (Some(b'*'), _) => ("*", false, 1),
            _ => {
                return Err(error(
                    start,
                    "element outside the organic subset must be bracketed",
                ))
            }
        };
        self.pos += width;
        self.push_atom(Atom::new(symbol, aromatic))
    }

    fn bracket_atom(&mut self) -> Result<(), RenderError> {
        let start = self.pos;
        self.pos += 1;

        let isotope_at = self.pos;
        let isotope = match self.number() {
            Some(n) => Some(
                u16::try_from(n).map_err(|_| error(isotope_at, "isotope mass out of range"))?,
            ),
            None => None,
        };

        let (symbol, aromatic) = match self.peek() {
            Some(c @ b'A'..=b'Z') => {
                self.pos += 1;
                let mut symbol = String::from(char::from(c));
                if let Some(l @ b'a'..=b'z') = self.peek() {
                    symbol.push(char::from(l));
                    self.pos += 1;
                }
                (symbol, false)
            }
            Some(b's') if self.peek_at(1) == Some(b'e') => {
                self.pos += 2;
                ("Se".to_string(), true)
            }
            Some(b'a') if self.peek_at(1) == Some(b's') => {
                self.pos += 2;
                ("As".to_string(), true)
            }
            Some(c @ (b'b' | b'c' | b'n' | b'o' | b'p' | b's')) => {
                self.pos += 1;
                (char::from(c).to_ascii_uppercase().to_string(), true)
            }
            Some(b'*') => {
                self.pos += 1;
                ("*".to_string(), false)
            }
            _ => return Err(error(self.pos, "expected element symbol in bracket atom")),
        };

        self.skip_chirality();

        let mut atom = Atom::new(symbol, aromatic);
        atom.isotope = isotope;

        if self.peek() == Some(b'H') {
            self.pos += 1;
            let count_at = self.pos;
            let count = match self.number() {
                Some(n) => u8::try_from(n).map_err(|_| error(count_at, "hydrogen count out of range"))?,
                None => 1,
            };
            atom.hydrogens = Some(count);
        }

        atom.charge = self.charge();

        if self.peek() == Some(b':') {
            self.pos += 1;
            match self.number() {
                Some(class) => atom.class = Some(class),
                None => return Err(error(self.pos, "expected atom class after ':'")),
            }
        }

        if self.peek() != Some(b']') {
            return Err(error(start, "unterminated bracket atom"));
        }
        self.pos += 1;
        self.push_atom(atom)
    }

    fn skip_chirality(&mut self) {
        while self.peek() == Some(b'@') {
            self.pos += 1;
        }
        let tag = (self.peek_at(0), self.peek_at(1));
        if matches!(
            tag,
            (Some(b'T'), Some(b'H' | b'B'))
                | (Some(b'A'), Some(b'L'))
                | (Some(b'S'), Some(b'P'))
                | (Some(b'O'), Some(b'H'))
        ) && self.pos > 0
            && self.bytes[self.pos - 1] == b'@'
        {
            self.pos += 2;
            self.number();
        }
    }

    fn charge(&mut self) -> i8 {
        let sign = match self.peek() {
            Some(b'+') => 1i8,
            Some(b'-') => -1i8,
            _ => return 0,
        };
        let symbol = self.bytes[self.pos];
        self.pos += 1;
        if let Some(n) = self.number() {
            return sign.saturating_mul(n.min(i8::MAX as u32) as i8);
        }
        let mut magnitude = 1i8;
        while self.peek() == Some(symbol) {
            self.pos += 1;
            magnitude = magnitude.saturating_add(1);
        }
        sign * magnitude
    }

    fn number(&mut self) -> Option<u32> {
        let start = self.pos;
        let mut value: u32 = 0;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            value = value.saturating_mul(10).saturating_add(u32::from(c - b'0'));
            self.pos += 1;
        }
        (self.pos > start).then_some(value)
    }

    fn push_atom(&mut self, atom: Atom) -> Result<(), RenderError> {
        let index = self.molecule.add_atom(atom);
        let bond = self.pending_bond.take();
        match (self.previous, bond) {
            (Some(previous), Some((order, _))) => self.molecule.add_bond(previous, index, order),
            (Some(previous), None) => {
                let order = self.default_order(previous, index);
                self.molecule.add_bond(previous, index, order);
            }
            (None, Some((_, at))) => return Err(error(at, "bond without a preceding atom")),
            (None, None) => {}
        }
        self.previous = Some(index);
        Ok(())
    }
}
