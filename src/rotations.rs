use crate::cube::Xyz;

/// One proper rotation of the cube, expressed as an axis permutation plus a
/// per-axis flip. Output axis k takes its value from input axis `perm[k]`,
/// negated (against the extent) when `flip[k]` is set.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    perm: [usize; 3],
    flip: [bool; 3],
}

/// All 24 proper rotations: for each of the six axis permutations, the four
/// flip patterns whose sign product matches the permutation parity.
pub const ROTATIONS: [Rotation; 24] = [
    // even permutations: zero or two flips
    Rotation { perm: [0, 1, 2], flip: [false, false, false] },
    Rotation { perm: [0, 1, 2], flip: [false, true, true] },
    Rotation { perm: [0, 1, 2], flip: [true, false, true] },
    Rotation { perm: [0, 1, 2], flip: [true, true, false] },
    Rotation { perm: [1, 2, 0], flip: [false, false, false] },
    Rotation { perm: [1, 2, 0], flip: [false, true, true] },
    Rotation { perm: [1, 2, 0], flip: [true, false, true] },
    Rotation { perm: [1, 2, 0], flip: [true, true, false] },
    Rotation { perm: [2, 0, 1], flip: [false, false, false] },
    Rotation { perm: [2, 0, 1], flip: [false, true, true] },
    Rotation { perm: [2, 0, 1], flip: [true, false, true] },
    Rotation { perm: [2, 0, 1], flip: [true, true, false] },
    // odd permutations: one or three flips
    Rotation { perm: [0, 2, 1], flip: [true, false, false] },
    Rotation { perm: [0, 2, 1], flip: [false, true, false] },
    Rotation { perm: [0, 2, 1], flip: [false, false, true] },
    Rotation { perm: [0, 2, 1], flip: [true, true, true] },
    Rotation { perm: [1, 0, 2], flip: [true, false, false] },
    Rotation { perm: [1, 0, 2], flip: [false, true, false] },
    Rotation { perm: [1, 0, 2], flip: [false, false, true] },
    Rotation { perm: [1, 0, 2], flip: [true, true, true] },
    Rotation { perm: [2, 1, 0], flip: [true, false, false] },
    Rotation { perm: [2, 1, 0], flip: [false, true, false] },
    Rotation { perm: [2, 1, 0], flip: [false, false, true] },
    Rotation { perm: [2, 1, 0], flip: [true, true, true] },
];

impl Rotation {
    /// Rotate a zero-aligned coordinate. Flipped axes are mirrored against
    /// the extent so the result stays in the non-negative octant.
    pub fn apply(&self, c: Xyz, shape: Xyz) -> Xyz {
        let mut out = [0i8; 3];
        for k in 0..3 {
            let v = c.0[self.perm[k]];
            out[k] = if self.flip[k] { shape.0[self.perm[k]] - v } else { v };
        }
        Xyz(out)
    }

    pub fn apply_shape(&self, shape: Xyz) -> Xyz {
        Xyz([
            shape.0[self.perm[0]],
            shape.0[self.perm[1]],
            shape.0[self.perm[2]],
        ])
    }
}

/// Reduce a zero-aligned coordinate set to its canonical form: the
/// lexicographically least sorted sequence over the rotations whose shape
/// comes out ordered dx <= dy <= dz. Returns the coordinates and that shape.
pub fn canonicalize(coords: &[Xyz]) -> (Vec<Xyz>, Xyz) {
    let mut shape = Xyz::new(0, 0, 0);
    for c in coords {
        for k in 0..3 {
            if c.0[k] > shape.0[k] {
                shape.0[k] = c.0[k];
            }
        }
    }

    let mut best: Option<(Vec<Xyz>, Xyz)> = None;
    for rot in ROTATIONS.iter() {
        let rshape = rot.apply_shape(shape);
        if !(rshape.x() <= rshape.y() && rshape.y() <= rshape.z()) {
            continue;
        }
        let mut rotated: Vec<Xyz> = coords.iter().map(|&c| rot.apply(c, shape)).collect();
        rotated.sort();
        match &best {
            Some((cur, _)) if *cur <= rotated => {}
            _ => best = Some((rotated, rshape)),
        }
    }
    // at least one permutation sorts the extents, so a candidate always exists
    best.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sorted(mut v: Vec<Xyz>) -> Vec<Xyz> {
        v.sort();
        v
    }

    #[test]
    fn identity_rotation_is_present() {
        let c = Xyz::new(1, 2, 3);
        let shape = Xyz::new(4, 5, 6);
        assert_eq!(ROTATIONS[0].apply(c, shape), c);
        assert_eq!(ROTATIONS[0].apply_shape(shape), shape);
    }

    #[test]
    fn rotations_are_distinct() {
        // applying each rotation to an asymmetric cube gives 24 different images
        let coords = vec![
            Xyz::new(0, 0, 0),
            Xyz::new(1, 0, 0),
            Xyz::new(1, 1, 0),
            Xyz::new(1, 1, 2),
        ];
        let mut shape = Xyz::new(0, 0, 0);
        for c in &coords {
            for k in 0..3 {
                shape.0[k] = shape.0[k].max(c.0[k]);
            }
        }
        let images: HashSet<Vec<Xyz>> = ROTATIONS
            .iter()
            .map(|r| sorted(coords.iter().map(|&c| r.apply(c, shape)).collect()))
            .collect();
        assert_eq!(images.len(), 24);
    }

    #[test]
    fn canonical_shape_is_sorted() {
        let coords = vec![Xyz::new(0, 0, 0), Xyz::new(1, 0, 0), Xyz::new(2, 0, 0)];
        let (canon, shape) = canonicalize(&coords);
        assert_eq!(shape, Xyz::new(0, 0, 2));
        assert_eq!(canon, vec![Xyz::new(0, 0, 0), Xyz::new(0, 0, 1), Xyz::new(0, 0, 2)]);
    }

    #[test]
    fn canonical_form_is_rotation_invariant() {
        let coords = vec![
            Xyz::new(0, 0, 0),
            Xyz::new(1, 0, 0),
            Xyz::new(1, 1, 0),
            Xyz::new(1, 1, 1),
        ];
        let mut shape = Xyz::new(0, 0, 0);
        for c in &coords {
            for k in 0..3 {
                shape.0[k] = shape.0[k].max(c.0[k]);
            }
        }
        let (canon, cshape) = canonicalize(&coords);
        for r in ROTATIONS.iter() {
            let rotated: Vec<Xyz> = coords.iter().map(|&c| r.apply(c, shape)).collect();
            let (again, ashape) = canonicalize(&rotated);
            assert_eq!(again, canon);
            assert_eq!(ashape, cshape);
        }
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let coords = vec![
            Xyz::new(0, 0, 0),
            Xyz::new(0, 1, 0),
            Xyz::new(0, 1, 1),
            Xyz::new(1, 1, 1),
            Xyz::new(1, 2, 1),
        ];
        let (canon, shape) = canonicalize(&coords);
        let (twice, shape2) = canonicalize(&canon);
        assert_eq!(twice, canon);
        assert_eq!(shape2, shape);
    }

    #[test]
    fn no_rotation_is_smaller_than_canonical() {
        let coords = vec![
            Xyz::new(0, 0, 0),
            Xyz::new(0, 0, 1),
            Xyz::new(0, 1, 1),
            Xyz::new(1, 1, 1),
        ];
        let (canon, _) = canonicalize(&coords);
        let mut shape = Xyz::new(0, 0, 0);
        for c in &canon {
            for k in 0..3 {
                shape.0[k] = shape.0[k].max(c.0[k]);
            }
        }
        for r in ROTATIONS.iter() {
            let rshape = r.apply_shape(shape);
            if !(rshape.x() <= rshape.y() && rshape.y() <= rshape.z()) {
                continue;
            }
            let rotated = sorted(canon.iter().map(|&c| r.apply(c, shape)).collect());
            assert!(canon <= rotated);
        }
    }
}
