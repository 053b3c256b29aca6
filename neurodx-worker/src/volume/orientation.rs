//! Orientation normalization to the RAS convention
//!
//! Only axis permutations and flips are applied; voxel spacing is never
//! resampled. The affine is updated so every voxel keeps its world position.

use ndarray::Axis;
use std::fmt;

use super::{Affine, Volume, IDENTITY_AFFINE};

/// Direction cosines below this are treated as "no component"
const AXIS_TOLERANCE: f64 = 1e-6;

/// Cosines below this mark a voxel axis as oblique to its world axis
const OBLIQUE_TOLERANCE: f64 = 1e-3;

/// Anatomical direction a voxel axis increases towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisCode {
    Right,
    Left,
    Anterior,
    Posterior,
    Superior,
    Inferior,
}

impl AxisCode {
    fn from_world(world_axis: usize, flipped: bool) -> Self {
        match (world_axis, flipped) {
            (0, false) => AxisCode::Right,
            (0, true) => AxisCode::Left,
            (1, false) => AxisCode::Anterior,
            (1, true) => AxisCode::Posterior,
            (2, false) => AxisCode::Superior,
            _ => AxisCode::Inferior,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            AxisCode::Right => 'R',
            AxisCode::Left => 'L',
            AxisCode::Anterior => 'A',
            AxisCode::Posterior => 'P',
            AxisCode::Superior => 'S',
            AxisCode::Inferior => 'I',
        }
    }
}

/// Canonical target orientation
pub const RAS: [AxisCode; 3] = [AxisCode::Right, AxisCode::Anterior, AxisCode::Superior];

/// Axis codes of a volume; `None` where an axis could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisCodes(pub [Option<AxisCode>; 3]);

impl AxisCodes {
    pub fn is_ras(&self) -> bool {
        self.0 == RAS.map(Some)
    }
}

impl fmt::Display for AxisCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for code in self.0 {
            write!(f, "{}", code.map(|c| c.letter()).unwrap_or('?'))?;
        }
        Ok(())
    }
}

/// Mapping of one voxel axis onto a world axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisOrientation {
    pub world_axis: usize,
    pub flipped: bool,
    /// Absolute direction cosine between the voxel axis and its world axis
    pub cosine: f64,
}

/// Assign each voxel axis to the world axis it is closest to
///
/// Greedy over normalized direction cosines: the strongest remaining
/// (world, voxel) pair is fixed first. Zero-length columns stay unresolved.
pub fn io_orientation(affine: &Affine) -> [Option<AxisOrientation>; 3] {
    let mut cosines = [[0.0f64; 3]; 3];
    for col in 0..3 {
        let norm = (0..3)
            .map(|row| affine[row][col] * affine[row][col])
            .sum::<f64>()
            .sqrt();
        if norm > AXIS_TOLERANCE {
            for row in 0..3 {
                cosines[row][col] = affine[row][col] / norm;
            }
        }
    }

    let mut result = [None; 3];
    let mut used_world = [false; 3];
    let mut used_voxel = [false; 3];

    for _ in 0..3 {
        let mut best: Option<(usize, usize, f64)> = None;
        for world in (0..3).filter(|&w| !used_world[w]) {
            for voxel in (0..3).filter(|&v| !used_voxel[v]) {
                let magnitude = cosines[world][voxel].abs();
                if magnitude > AXIS_TOLERANCE
                    && best.map_or(true, |(_, _, current)| magnitude > current)
                {
                    best = Some((world, voxel, magnitude));
                }
            }
        }

        let Some((world, voxel, magnitude)) = best else {
            break;
        };
        used_world[world] = true;
        used_voxel[voxel] = true;
        result[voxel] = Some(AxisOrientation {
            world_axis: world,
            flipped: cosines[world][voxel] < 0.0,
            cosine: magnitude,
        });
    }

    result
}

/// Anatomical axis codes implied by an affine
pub fn axis_codes(affine: &Affine) -> AxisCodes {
    AxisCodes(io_orientation(affine).map(|o| o.map(|o| AxisCode::from_world(o.world_axis, o.flipped))))
}

/// Result of [`canonicalize`]
#[derive(Debug, Clone)]
pub struct Canonicalized {
    pub volume: Volume,
    /// Orientation of the input before reorientation
    pub input_codes: AxisCodes,
    /// Problems that kept the output from being exactly RAS
    pub warnings: Vec<String>,
}

impl Canonicalized {
    pub fn output_codes(&self) -> AxisCodes {
        axis_codes(self.volume.affine())
    }

    pub fn is_fully_canonical(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Reorient a volume to RAS using its own affine
///
/// Unresolvable axes keep their relative order and produce a warning; the
/// volume is still returned so processing can continue.
pub fn canonicalize(volume: Volume) -> Canonicalized {
    let input_codes = axis_codes(volume.affine());
    let orientation = io_orientation(volume.affine());
    let mut warnings = Vec::new();

    // source[k] = voxel axis that becomes output axis k
    let mut source: [Option<usize>; 3] = [None; 3];
    let mut flips = [false; 3];
    for (voxel, mapping) in orientation.iter().enumerate() {
        if let Some(mapping) = mapping {
            source[mapping.world_axis] = Some(voxel);
            flips[mapping.world_axis] = mapping.flipped;
            if mapping.cosine < 1.0 - OBLIQUE_TOLERANCE {
                warnings.push(format!(
                    "voxel axis {} is oblique (cosine {:.4}); nearest world axis used",
                    voxel,
                    mapping.cosine
                ));
            }
        }
    }

    let mut unresolved = (0..3).filter(|&voxel| orientation[voxel].is_none());
    let source: [usize; 3] = std::array::from_fn(|k| {
        source[k].unwrap_or_else(|| {
            let voxel = unresolved.next().unwrap_or(k);
            warnings.push(format!(
                "voxel axis {} has no usable direction; kept in place of world axis {}",
                voxel, k
            ));
            voxel
        })
    });

    let shape = volume.shape();
    let (data, affine) = volume.into_parts();

    let mut data = data.permuted_axes(source);
    for (k, &flip) in flips.iter().enumerate() {
        if flip {
            data.invert_axis(Axis(k));
        }
    }
    let data = data.as_standard_layout().into_owned();

    let mut new_affine = IDENTITY_AFFINE;
    for row in 0..3 {
        let mut translation = affine[row][3];
        for k in 0..3 {
            let column = affine[row][source[k]];
            if flips[k] {
                new_affine[row][k] = -column;
                translation += column * (shape[source[k]] as f64 - 1.0);
            } else {
                new_affine[row][k] = column;
            }
        }
        new_affine[row][3] = translation;
    }

    for warning in &warnings {
        tracing::warn!(input = %input_codes, "Orientation not fully canonical: {}", warning);
    }

    let volume = Volume { data, affine: new_affine };
    Canonicalized {
        volume,
        input_codes,
        warnings,
    }
}
