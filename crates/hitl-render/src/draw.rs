//! Rasterised molecule depictions with translucent highlights.

use hitl_types::RenderError;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{register_font, FontStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::layout;
use crate::molecule::{BondOrder, Molecule};

type Canvas<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

const LEGEND_FONT: &str = "hitl-legend";
static LEGEND_FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

fn ensure_legend_font() -> Result<(), RenderError> {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    let ok = *REGISTERED
        .get_or_init(|| register_font(LEGEND_FONT, FontStyle::Normal, LEGEND_FONT_BYTES).is_ok());
    if ok {
        Ok(())
    } else {
        Err(RenderError::Draw {
            message: "bundled legend font could not be loaded".to_string(),
        })
    }
}

/// Canvas and style settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawOptions {
    pub width: u32,
    pub height: u32,
    /// Opacity of highlight discs and bars.
    pub highlight_alpha: f64,
    pub margin: f64,
    /// Upper bound on the bond length in pixels for small molecules.
    pub max_bond_px: f64,
    pub bond_width: u32,
    /// Gap between the strokes of a multiple bond, in pixels.
    pub multiple_bond_offset: f64,
    /// Highlight disc radius as a fraction of the bond length.
    pub highlight_radius: f64,
    /// Radius of the marker drawn on non-carbon atoms, in pixels.
    pub heteroatom_radius: i32,
    /// Band at the bottom of the canvas reserved for the legend.
    pub legend_height: u32,
    pub legend_font_size: f64,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            width: 350,
            height: 300,
            highlight_alpha: 0.4,
            margin: 24.0,
            max_bond_px: 40.0,
            bond_width: 2,
            multiple_bond_offset: 3.0,
            highlight_radius: 0.35,
            heteroatom_radius: 5,
            legend_height: 24,
            legend_font_size: 15.0,
        }
    }
}

/// Highlight colour, components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HighlightColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl HighlightColor {
    pub fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    /// 8-bit channels; components outside `[0, 1]` (and NaN) are clamped.
    pub fn to_rgb8(self) -> (u8, u8, u8) {
        fn channel(v: f64) -> u8 {
            let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
            (v * 255.0).round() as u8
        }
        (channel(self.r), channel(self.g), channel(self.b))
    }
}

/// Renders one molecule; the layout is computed once and reused.
#[derive(Debug, Clone)]
pub struct MoleculeRenderer {
    molecule: Molecule,
    pixels: Vec<(i32, i32)>,
    bond_px: f64,
    options: DrawOptions,
}

fn draw_err(e: impl std::fmt::Display) -> RenderError {
    RenderError::Draw {
        message: e.to_string(),
    }
}

fn encode_err(e: png::EncodingError) -> RenderError {
    RenderError::Encode {
        message: e.to_string(),
    }
}

impl MoleculeRenderer {
    pub fn new(molecule: Molecule, options: DrawOptions) -> Self {
        let points = layout::compute(&molecule);
        let pixels = layout::fit_to_canvas(
            &points,
            options.width,
            options.height.saturating_sub(options.legend_height),
            options.margin,
            options.max_bond_px,
        );
        let bond_px = mean_bond_length(&molecule, &pixels).unwrap_or(options.max_bond_px);
        debug!(
            atoms = molecule.atom_count(),
            bonds = molecule.bond_count(),
            bond_px,
            "molecule laid out"
        );
        Self {
            molecule,
            pixels,
            bond_px,
            options,
        }
    }

    pub fn molecule(&self) -> &Molecule {
        &self.molecule
    }

    pub fn options(&self) -> &DrawOptions {
        &self.options
    }

    /// Draw the molecule with `highlight_atoms` (and bonds between two of
    /// them) overlaid in `color`, returning PNG bytes. The legend is drawn
    /// centred below the molecule and also stored in the PNG `Title` chunk.
    pub fn render(
        &self,
        color: HighlightColor,
        legend: &str,
        highlight_atoms: &[usize],
    ) -> Result<Vec<u8>, RenderError> {
        let atom_count = self.molecule.atom_count();
        if let Some(&index) = highlight_atoms.iter().find(|&&i| i >= atom_count) {
            return Err(RenderError::AtomOutOfRange { index, atom_count });
        }

        let (w, h) = (self.options.width, self.options.height);
        let mut buffer = vec![0u8; w as usize * h as usize * 3];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (w, h)).into_drawing_area();
            root.fill(&WHITE).map_err(draw_err)?;
            self.draw_highlights(&root, color, highlight_atoms)?;
            self.draw_bonds(&root)?;
            self.draw_heteroatoms(&root)?;
            self.draw_legend(&root, legend)?;
            root.present().map_err(draw_err)?;
        }

        encode_png(&buffer, w, h, legend)
    }

    fn draw_highlights(
        &self,
        root: &Canvas<'_>,
        color: HighlightColor,
        highlight_atoms: &[usize],
    ) -> Result<(), RenderError> {
        let (r, g, b) = color.to_rgb8();
        let fill = RGBColor(r, g, b).mix(self.options.highlight_alpha);
        let selected: HashSet<usize> = highlight_atoms.iter().copied().collect();
        let radius = (self.bond_px * self.options.highlight_radius).round().max(1.0) as i32;

        for bond in &self.molecule.bonds {
            if selected.contains(&bond.begin) && selected.contains(&bond.end) {
                let style = fill.stroke_width(radius as u32);
                root.draw(&PathElement::new(
                    vec![self.pixels[bond.begin], self.pixels[bond.end]],
                    style,
                ))
                .map_err(draw_err)?;
            }
        }
        let mut ordered: Vec<usize> = selected.into_iter().collect();
        ordered.sort_unstable();
        for atom in ordered {
            root.draw(&Circle::new(self.pixels[atom], radius, fill.filled()))
                .map_err(draw_err)?;
        }
        Ok(())
    }

    fn draw_bonds(&self, root: &Canvas<'_>) -> Result<(), RenderError> {
        for bond in &self.molecule.bonds {
            let a = self.pixels[bond.begin];
            let b = self.pixels[bond.end];
            let ca = self.molecule.atoms[bond.begin].color();
            let cb = self.molecule.atoms[bond.end].color();
            let offset = self.options.multiple_bond_offset;

            let strokes: Vec<(f64, bool)> = match bond.order {
                BondOrder::Single => vec![(0.0, true)],
                BondOrder::Double => vec![(-offset, true), (offset, true)],
                BondOrder::Aromatic => vec![(0.0, true), (2.0 * offset, false)],
                BondOrder::Triple | BondOrder::Quadruple => {
                    vec![(-2.0 * offset, true), (0.0, true), (2.0 * offset, true)]
                }
            };
            debug_assert_eq!(strokes.len(), bond.order.strokes());

            for (shift, solid) in strokes {
                let (p, q) = parallel(a, b, shift);
                let m = midpoint(p, q);
                let width = if solid {
                    self.options.bond_width
                } else {
                    self.options.bond_width.saturating_sub(1).max(1)
                };
                for (from, to, (r, g, bl)) in [(p, m, ca), (m, q, cb)] {
                    let style = RGBColor(r, g, bl).stroke_width(width);
                    root.draw(&PathElement::new(vec![from, to], style))
                        .map_err(draw_err)?;
                }
            }
        }
        Ok(())
    }

    fn draw_legend(&self, root: &Canvas<'_>, legend: &str) -> Result<(), RenderError> {
        if legend.is_empty() {
            return Ok(());
        }
        ensure_legend_font()?;
        let style = (LEGEND_FONT, self.options.legend_font_size)
            .into_font()
            .color(&BLACK)
            .pos(Pos::new(HPos::Center, VPos::Center));
        let band = self.options.legend_height.min(self.options.height);
        let anchor = (
            (self.options.width / 2) as i32,
            (self.options.height - band / 2) as i32,
        );
        root.draw_text(legend, &style, anchor).map_err(draw_err)
    }

    fn draw_heteroatoms(&self, root: &Canvas<'_>) -> Result<(), RenderError> {
        for (atom, &p) in self.molecule.atoms.iter().zip(&self.pixels) {
            if atom.is_carbon() {
                continue;
            }
            let (r, g, b) = atom.color();
            root.draw(&Circle::new(
                p,
                self.options.heteroatom_radius,
                RGBColor(r, g, b).filled(),
            ))
            .map_err(draw_err)?;
        }
        Ok(())
    }
}

fn mean_bond_length(molecule: &Molecule, pixels: &[(i32, i32)]) -> Option<f64> {
    if molecule.bonds.is_empty() {
        return None;
    }
    let total: f64 = molecule
        .bonds
        .iter()
        .map(|b| {
            let (p, q) = (pixels[b.begin], pixels[b.end]);
            f64::from(p.0 - q.0).hypot(f64::from(p.1 - q.1))
        })
        .sum();
    Some(total / molecule.bonds.len() as f64)
}

fn midpoint(p: (i32, i32), q: (i32, i32)) -> (i32, i32) {
    ((p.0 + q.0) / 2, (p.1 + q.1) / 2)
}

/// Segment parallel to `a`-`b` at perpendicular distance `shift`. Shifted
/// strokes are shortened so they sit inside rings and away from atoms.
fn parallel(a: (i32, i32), b: (i32, i32), shift: f64) -> ((i32, i32), (i32, i32)) {
    if shift == 0.0 {
        return (a, b);
    }
    let dx = f64::from(b.0 - a.0);
    let dy = f64::from(b.1 - a.1);
    let len = dx.hypot(dy);
    if len < 1.0 {
        return (a, b);
    }
    let (nx, ny) = (-dy / len * shift, dx / len * shift);
    let trim = 0.15;
    let p = (
        f64::from(a.0) + dx * trim + nx,
        f64::from(a.1) + dy * trim + ny,
    );
    let q = (
        f64::from(b.0) - dx * trim + nx,
        f64::from(b.1) - dy * trim + ny,
    );
    (
        (p.0.round() as i32, p.1.round() as i32),
        (q.0.round() as i32, q.1.round() as i32),
    )
}

/// Encode an RGB8 buffer as PNG with `legend` as the image title.
fn encode_png(buffer: &[u8], width: u32, height: u32, legend: &str) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder
            .add_text_chunk("Title".to_string(), legend.to_string())
            .map_err(encode_err)?;
        let mut writer = encoder.write_header().map_err(encode_err)?;
        writer.write_image_data(buffer).map_err(encode_err)?;
        writer.finish().map_err(encode_err)?;
    }
    Ok(out)
}
