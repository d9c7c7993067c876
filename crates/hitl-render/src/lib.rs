//! # hitl-render
//!
//! Turns a structure string into a PNG depiction with a set of atoms
//! highlighted in a caller-chosen colour.
//!
//! The pipeline is SMILES parsing ([`smiles::parse`]), a deterministic 2-D
//! layout ([`layout::compute`]) and rasterisation through plotters' bitmap
//! backend ([`MoleculeRenderer`]). Identical inputs always produce
//! byte-identical PNGs.

pub mod draw;
pub mod layout;
pub mod molecule;
pub mod smiles;

pub use draw::{DrawOptions, HighlightColor, MoleculeRenderer};
pub use layout::Point;
pub use molecule::{Atom, Bond, BondOrder, Molecule};

use hitl_types::RenderError;

/// Doravirine, the structure shown to raters.
pub const DORAVIRINE_SMILES: &str =
    "Cn1c(n[nH]c1=O)Cn2ccc(c(c2=O)Oc3cc(cc(c3)Cl)C#N)C(F)(F)F";

/// One-shot rendering with default draw options.
pub fn render(
    structure: &str,
    r: f64,
    g: f64,
    b: f64,
    legend: &str,
    highlight_atoms: &[usize],
) -> Result<Vec<u8>, RenderError> {
    let molecule = smiles::parse(structure)?;
    MoleculeRenderer::new(molecule, DrawOptions::default()).render(
        HighlightColor::new(r, g, b),
        legend,
        highlight_atoms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_render_is_stable() {
        let highlight: Vec<usize> = (0..=6).collect();
        let a = render(DORAVIRINE_SMILES, 0.0, 0.0, 0.0, "trial 0", &highlight).unwrap();
        let b = render(DORAVIRINE_SMILES, 0.0, 0.0, 0.0, "trial 0", &highlight).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bad_structure_is_a_smiles_error() {
        let err = render("C1CC(", 0.5, 0.5, 0.5, "trial 0", &[]).unwrap_err();
        assert!(matches!(err, RenderError::Smiles { .. }));
    }
}
