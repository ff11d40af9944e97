//! Polynomial transform stacks and geo-transforms
//!
//! A band may carry a `MapToPixelXForm` child whose `XForm<n>` children are
//! polynomials of order 1 to 3. Stored polynomials map map coordinates to
//! pixel coordinates; the reverse list maps pixels back to the map.

use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::pack::PixelType;

/// Six-term affine transform: `x = g0 + g1*col + g2*row`, `y = g3 + g4*col + g5*row`
pub type GeoTransform = [f64; 6];

/// Identity geo-transform reported when a band has no georeferencing
pub const IDENTITY: GeoTransform = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Determinants smaller than this are treated as singular
pub const SINGULAR_EPSILON: f64 = 1e-15;

/// Invert an affine transform
pub fn invert(gt: &GeoTransform) -> Option<GeoTransform> {
    let det = gt[1] * gt[5] - gt[2] * gt[4];
    if det.abs() < SINGULAR_EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        (gt[2] * gt[3] - gt[0] * gt[5]) * inv,
        gt[5] * inv,
        -gt[2] * inv,
        (-gt[1] * gt[3] + gt[0] * gt[4]) * inv,
        -gt[4] * inv,
        gt[1] * inv,
    ])
}

/// Number of terms of a two-dimensional polynomial of `order`
pub fn term_count(order: u8) -> Option<usize> {
    match order {
        1 => Some(3),
        2 => Some(6),
        3 => Some(10),
        _ => None,
    }
}

/// One step of a transform stack
///
/// `matrix` holds the x and y coefficients of every non-constant term,
/// interleaved: x, y, x², xy, y², x³, x²y, xy², y³.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    pub order: u8,
    pub vector: [f64; 2],
    pub matrix: Vec<f64>,
}

impl Polynomial {
    /// First-order polynomial with the same effect as `gt`
    pub fn affine(gt: &GeoTransform) -> Self {
        Polynomial {
            order: 1,
            vector: [gt[0], gt[3]],
            matrix: vec![gt[1], gt[4], gt[2], gt[5]],
        }
    }

    /// The affine form of a first-order polynomial
    pub fn to_affine(&self) -> Option<GeoTransform> {
        if self.order != 1 || self.matrix.len() < 4 {
            return None;
        }
        let m = &self.matrix;
        Some([self.vector[0], m[0], m[2], self.vector[1], m[1], m[3]])
    }

    /// Inverse of a first-order polynomial
    pub fn inverse(&self) -> Option<Self> {
        self.to_affine()
            .as_ref()
            .and_then(invert)
            .map(|inv| Polynomial::affine(&inv))
    }

    /// Apply to one point; `None` for unsupported orders
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let terms = term_count(self.order)?;
        if self.matrix.len() < 2 * (terms - 1) {
            return None;
        }
        let monomials = [
            x,
            y,
            x * x,
            x * y,
            y * y,
            x * x * x,
            x * x * y,
            x * y * y,
            y * y * y,
        ];
        let (mut nx, mut ny) = (self.vector[0], self.vector[1]);
        for (i, term) in monomials.iter().take(terms - 1).enumerate() {
            nx += self.matrix[2 * i] * term;
            ny += self.matrix[2 * i + 1] * term;
        }
        Some((nx, ny))
    }
}

/// Forward (map to pixel) and reverse (pixel to map) polynomial lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformStack {
    pub forward: Vec<Polynomial>,
    pub reverse: Vec<Polynomial>,
}

impl TransformStack {
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Push a point through the stack
    ///
    /// Forward applies the forward list in order; backward applies the
    /// reverse list last step first. Fails on any unsupported order.
    pub fn evaluate(&self, forward: bool, x: f64, y: f64) -> Option<(f64, f64)> {
        let mut point = (x, y);
        if forward {
            for poly in &self.forward {
                point = poly.apply(point.0, point.1)?;
            }
        } else {
            for poly in self.reverse.iter().rev() {
                point = poly.apply(point.0, point.1)?;
            }
        }
        Some(point)
    }
}

/// Read and check the polynomial stored under `prefix` of `node`
///
/// Returns `None` when the stored shape is not a 2-D polynomial of order 1
/// to 3 with a matching term count.
pub fn read_polynomial(tree: &mut EntryTree, node: EntryId, prefix: &str) -> Result<Option<Polynomial>> {
    let int = |tree: &mut EntryTree, name: &str| tree.get_int(node, &format!("{}{}", prefix, name));
    let order = int(tree, "order")?;
    let dims = (int(tree, "numdimtransform")?, int(tree, "numdimpolynomial")?);
    let terms = int(tree, "termcount")?;

    let order = match u8::try_from(order) {
        Ok(order @ 1..=3) => order,
        _ => return Ok(None),
    };
    if dims != (2, 2) || term_count(order) != usize::try_from(terms).ok() {
        return Ok(None);
    }

    let coefficients = 2 * (terms as usize - 1);
    let matrix = (0..coefficients)
        .map(|i| tree.get_double(node, &format!("{}polycoefmtx[{}]", prefix, i)))
        .collect::<Result<Vec<f64>>>()?;
    let vector = [
        tree.get_double(node, &format!("{}polycoefvector[0]", prefix))?,
        tree.get_double(node, &format!("{}polycoefvector[1]", prefix))?,
    ];
    Ok(Some(Polynomial { order, vector, matrix }))
}

/// Load the transform stack of a band
///
/// `Efga_Polynomial` steps carry only the forward direction, so their
/// reverse is the inverse. `GM_PolyPair` steps store both. Steps that fail
/// to read are skipped.
pub fn read_stack(tree: &mut EntryTree, band: EntryId) -> Result<TransformStack> {
    let mut stack = TransformStack::default();
    let Some(header) = tree.named_child(band, "MapToPixelXForm")? else {
        return Ok(stack);
    };

    for step in tree.children(header)? {
        let type_name = tree.type_name(step).to_string();
        let pair = match type_name.as_str() {
            "Efga_Polynomial" => match read_polynomial(tree, step, "") {
                Ok(Some(forward)) => forward.inverse().map(|reverse| (forward, reverse)),
                _ => None,
            },
            "GM_PolyPair" => {
                let forward = read_polynomial(tree, step, "forward.").ok().flatten();
                let reverse = read_polynomial(tree, step, "reverse.").ok().flatten();
                forward.zip(reverse)
            }
            _ => continue,
        };
        match pair {
            Some((forward, reverse)) => {
                stack.forward.push(forward);
                stack.reverse.push(reverse);
            }
            None => tracing::debug!("Skipping unreadable transform step {}", tree.name(step)),
        }
    }
    Ok(stack)
}

/// Replace the transform stack of a band
///
/// Only first-order steps can be written; their reverse is recovered by
/// inversion on read.
pub fn write_stack(tree: &mut EntryTree, band: EntryId, stack: &TransformStack) -> Result<()> {
    if let Some(poly) = stack.forward.iter().find(|p| p.order != 1) {
        return Err(HfaError::NotSupported(format!(
            "writing order {} transform steps",
            poly.order
        )));
    }

    let header = match tree.named_child(band, "MapToPixelXForm")? {
        Some(header) => header,
        None => {
            let header = tree.new_child(band, "MapToPixelXForm", "Exfr_GenericXFormHeader")?;
            tree.make_data(header, 23)?;
            tree.set_position(header)?;
            tree.set_field(header, "titleList.string", "Affine")?;
            header
        }
    };
    for old in tree.children(header)? {
        tree.remove(old)?;
    }

    let f64_code = PixelType::F64.code();
    for (i, poly) in stack.forward.iter().enumerate() {
        let step = tree.new_child(header, &format!("XForm{}", i), "Efga_Polynomial")?;
        tree.make_data(step, 136)?;
        tree.set_position(step)?;

        tree.set_field(step, "order", 1)?;
        tree.set_field(step, "numdimtransform", 2)?;
        tree.set_field(step, "numdimpolynomial", 2)?;
        tree.set_field(step, "termcount", 3)?;
        for (j, exponent) in [0, 0, 1, 0, 0, 1].into_iter().enumerate() {
            tree.set_field(step, &format!("exponentlist[{}]", j), exponent)?;
        }

        tree.set_field(step, "polycoefmtx[-3]", f64_code)?;
        tree.set_field(step, "polycoefmtx[-2]", 2)?;
        tree.set_field(step, "polycoefmtx[-1]", 2)?;
        for (j, value) in poly.matrix.iter().take(4).enumerate() {
            tree.set_field(step, &format!("polycoefmtx[{}]", j), *value)?;
        }

        tree.set_field(step, "polycoefvector[-3]", f64_code)?;
        tree.set_field(step, "polycoefvector[-2]", 1)?;
        tree.set_field(step, "polycoefvector[-1]", 2)?;
        for (j, value) in poly.vector.iter().enumerate() {
            tree.set_field(step, &format!("polycoefvector[{}]", j), *value)?;
        }
    }
    Ok(())
}

/// Geo-transform from the corner centers and pixel size of a MapInfo
///
/// Coordinates in arc-seconds (`ds`) are converted to degrees.
pub fn from_corners(
    upper_left: (f64, f64),
    lower_right: (f64, f64),
    pixel_size: (f64, f64),
    units: &str,
) -> GeoTransform {
    let row_step = if upper_left.1 >= lower_right.1 {
        -pixel_size.1
    } else {
        pixel_size.1
    };
    // Only the step terms fall back to one; the origin keeps the raw size
    let mut gt = [
        upper_left.0 - pixel_size.0 * 0.5,
        if pixel_size.0 == 0.0 { 1.0 } else { pixel_size.0 },
        0.0,
        upper_left.1 - row_step * 0.5,
        0.0,
        if row_step == 0.0 { 1.0 } else { row_step },
    ];
    if units.eq_ignore_ascii_case("ds") {
        gt.iter_mut().for_each(|v| *v /= 3600.0);
    }
    gt
}

/// Geo-transform equivalent to a single affine map-to-pixel step
///
/// Stored steps address pixel centers; the result addresses pixel corners.
pub fn from_map_to_pixel(poly: &Polynomial) -> Option<GeoTransform> {
    let forward = poly.to_affine()?;
    let mut gt = invert(&forward).unwrap_or([0.0; 6]);
    gt[0] -= gt[1] * 0.5 + gt[2] * 0.5;
    gt[3] -= gt[4] * 0.5 + gt[5] * 0.5;
    Some(gt)
}

/// Map-to-pixel step equivalent to a corner-addressed geo-transform
pub fn to_map_to_pixel(gt: &GeoTransform) -> Polynomial {
    let mut centered = *gt;
    centered[0] += centered[1] * 0.5 + centered[2] * 0.5;
    centered[3] += centered[4] * 0.5 + centered[5] * 0.5;
    Polynomial::affine(&invert(&centered).unwrap_or([0.0; 6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SpaceAllocator;
    use crate::dictionary::TypeDictionary;
    use crate::header::ENTRY_HEADER_LEN;
    use crate::io::HfaFile;
    use tempfile::NamedTempFile;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_invert_identity() {
        assert_eq!(invert(&IDENTITY), Some(IDENTITY));
    }

    #[test]
    fn test_invert_singular() {
        assert_eq!(invert(&[10.0, 0.0, 0.0, 20.0, 0.0, 0.0]), None);
        assert_eq!(invert(&[0.0, 1.0, 2.0, 0.0, 2.0, 4.0]), None);
    }

    #[test]
    fn test_invert_round_trip() {
        let gt = [440720.0, 60.0, 0.0, 3751320.0, 0.0, -60.0];
        let inv = invert(&gt).unwrap();
        let back = invert(&inv).unwrap();
        assert!(close(&gt, &back));
    }

    #[test]
    fn test_identity_stack_evaluates_both_ways() {
        let identity = Polynomial::affine(&IDENTITY);
        let stack = TransformStack {
            forward: vec![identity.clone()],
            reverse: vec![identity],
        };
        assert_eq!(stack.evaluate(true, 3.5, -2.0), Some((3.5, -2.0)));
        assert_eq!(stack.evaluate(false, 3.5, -2.0), Some((3.5, -2.0)));
    }

    #[test]
    fn test_second_order_terms() {
        let poly = Polynomial {
            order: 2,
            vector: [1.0, 2.0],
            // x' = 1 + x + x², y' = 2 + y + xy
            matrix: vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        };
        assert_eq!(poly.apply(2.0, 3.0), Some((7.0, 11.0)));
    }

    #[test]
    fn test_unsupported_order_fails() {
        let poly = Polynomial {
            order: 4,
            vector: [0.0; 2],
            matrix: vec![0.0; 30],
        };
        let stack = TransformStack {
            forward: vec![poly.clone()],
            reverse: vec![poly],
        };
        assert_eq!(stack.evaluate(true, 1.0, 1.0), None);
    }

    #[test]
    fn test_geo_transform_from_corners() {
        let gt = from_corners((100.5, 200.5), (110.5, 190.5), (1.0, 1.0), "meters");
        assert_eq!(gt, [100.0, 1.0, 0.0, 201.0, 0.0, -1.0]);

        let gt = from_corners((3600.0, 7200.0), (7200.0, 3600.0), (2.0, 4.0), "ds");
        assert!(close(&gt, &[(3600.0 - 1.0) / 3600.0, 2.0 / 3600.0, 0.0, (7200.0 + 2.0) / 3600.0, 0.0, -4.0 / 3600.0]));
    }

    #[test]
    fn test_zero_pixel_size_keeps_origin() {
        // The origin uses the stored size, only the steps become one
        let gt = from_corners((100.5, 200.5), (110.5, 190.5), (0.0, 0.0), "meters");
        assert_eq!(gt, [100.5, 1.0, 0.0, 200.5, 0.0, 1.0]);

        let gt = from_corners((3600.0, 7200.0), (7200.0, 3600.0), (0.0, 0.0), "ds");
        assert!(close(&gt, &[1.0, 1.0 / 3600.0, 0.0, 2.0, 0.0, 1.0 / 3600.0]));
    }

    #[test]
    fn test_map_to_pixel_round_trip() {
        let gt = [1000.0, 30.0, 0.0, 5000.0, 0.0, -30.0];
        let poly = to_map_to_pixel(&gt);
        assert!(close(&from_map_to_pixel(&poly).unwrap(), &gt));
    }

    #[test]
    fn test_stack_persists_in_entry_tree() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = EntryTree::create(
            HfaFile::create(temp.path()).unwrap(),
            SpaceAllocator::new(64),
            TypeDictionary::with_defaults().unwrap(),
            ENTRY_HEADER_LEN,
        );
        let root = tree.root();
        let band = tree.new_child(root, "Layer_1", "Eimg_Layer").unwrap();

        let gt = [500000.0, 10.0, 0.0, 4000000.0, 0.0, -10.0];
        let forward = to_map_to_pixel(&gt);
        let stack = TransformStack {
            reverse: vec![forward.inverse().unwrap()],
            forward: vec![forward],
        };
        write_stack(&mut tree, band, &stack).unwrap();

        let read = read_stack(&mut tree, band).unwrap();
        assert_eq!(read.len(), 1);
        assert!(close(&read.forward[0].matrix, &stack.forward[0].matrix));
        // Pixel (0, 0) addresses the center of the first pixel
        let (x, y) = read.evaluate(false, 0.0, 0.0).unwrap();
        assert!((x - 500005.0).abs() < 1e-6 && (y - 3999995.0).abs() < 1e-6);
        let (col, row) = read.evaluate(true, 500025.0, 3999975.0).unwrap();
        assert!((col - 2.0).abs() < 1e-9 && (row - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_write_rejects_higher_orders() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = EntryTree::create(
            HfaFile::create(temp.path()).unwrap(),
            SpaceAllocator::new(64),
            TypeDictionary::with_defaults().unwrap(),
            ENTRY_HEADER_LEN,
        );
        let root = tree.root();
        let band = tree.new_child(root, "Layer_1", "Eimg_Layer").unwrap();
        let stack = TransformStack {
            forward: vec![Polynomial {
                order: 2,
                vector: [0.0; 2],
                matrix: vec![0.0; 10],
            }],
            reverse: Vec::new(),
        };
        assert!(matches!(
            write_stack(&mut tree, band, &stack),
            Err(HfaError::NotSupported(_))
        ));
    }
}
