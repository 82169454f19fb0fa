use glam::{Mat4, Vec3};

/// Axis-aligned bounding box tracked as component-wise min/max.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn extend(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Bounds of one of the eight child octants, split at the center.
    /// Octant bit layout: bit 0 = +x half, bit 1 = +y half, bit 2 = +z half.
    pub fn octant(&self, i: usize) -> Aabb {
        let c = self.center();
        let min = Vec3::new(
            if i & 1 != 0 { c.x } else { self.min.x },
            if i & 2 != 0 { c.y } else { self.min.y },
            if i & 4 != 0 { c.z } else { self.min.z },
        );
        let max = Vec3::new(
            if i & 1 != 0 { self.max.x } else { c.x },
            if i & 2 != 0 { self.max.y } else { c.y },
            if i & 4 != 0 { self.max.z } else { c.z },
        );
        Aabb { min, max }
    }

    /// Octant index of a point relative to the box center.
    pub fn octant_of(&self, p: Vec3) -> usize {
        let c = self.center();
        (usize::from(p.x >= c.x)) | (usize::from(p.y >= c.y) << 1) | (usize::from(p.z >= c.z) << 2)
    }

    pub fn from_positions<'a>(points: impl Iterator<Item = &'a [f32]>) -> Aabb {
        let mut bounds = Aabb::empty();
        for p in points {
            bounds.extend(Vec3::new(p[0], p[1], p[2]));
        }
        bounds
    }
}

/// Half-space `normal . p + d >= 0`, normal unit length.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_coefficients(a: f32, b: f32, c: f32, d: f32) -> Self {
        let normal = Vec3::new(a, b, c);
        let len = normal.length();
        Self {
            normal: normal / len,
            d: d / len,
        }
    }

    #[inline]
    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersects,
    Inside,
}

/// View frustum as six inward-facing half-spaces, extracted from a combined
/// view-projection matrix with zero-to-one clip depth.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn from_view_proj(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);
        let left = r3 + r0;
        let right = r3 - r0;
        let bottom = r3 + r1;
        let top = r3 - r1;
        let near = r2;
        let far = r3 - r2;
        let planes = [left, right, bottom, top, near, far]
            .map(|v| Plane::from_coefficients(v.x, v.y, v.z, v.w));
        Self { planes }
    }

    /// Frustum with every plane pushed outward by `eps`.
    pub fn expanded(&self, eps: f32) -> Frustum {
        let mut planes = self.planes;
        for p in &mut planes {
            p.d += eps;
        }
        Frustum { planes }
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes.iter().all(|pl| pl.signed_distance(p) >= 0.0)
    }

    /// Coarse containment of a box. A box past any single plane is
    /// `Outside`; a box on the inner side of all planes is `Inside`.
    pub fn classify(&self, b: &Aabb) -> Containment {
        let mut intersects = false;
        for plane in &self.planes {
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), b.max, b.min);
            if plane.signed_distance(positive) < 0.0 {
                return Containment::Outside;
            }
            let negative = Vec3::select(plane.normal.cmpge(Vec3::ZERO), b.min, b.max);
            if plane.signed_distance(negative) < 0.0 {
                intersects = true;
            }
        }
        if intersects {
            Containment::Intersects
        } else {
            Containment::Inside
        }
    }
}

/// The part of a camera transform the sorter needs: the eye position and
/// the unit forward axis depth is measured along.
#[derive(Debug, Clone, Copy)]
pub struct CameraPose {
    pub position: Vec3,
    pub forward: Vec3,
}

impl CameraPose {
    pub fn new(position: Vec3, forward: Vec3) -> Self {
        Self {
            position,
            forward: forward.normalize(),
        }
    }

    /// Recover the pose from a world-to-camera view matrix. The camera
    /// looks down its local -Z axis.
    pub fn from_view(view: &Mat4) -> Self {
        let inv = view.inverse();
        let position = inv.w_axis.truncate();
        let forward = -inv.z_axis.truncate().normalize();
        Self { position, forward }
    }

    #[inline]
    pub fn depth_of(&self, p: Vec3) -> f32 {
        (p - self.position).dot(self.forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octants_partition_the_box() {
        let b = Aabb {
            min: Vec3::ZERO,
            max: Vec3::splat(2.0),
        };
        for i in 0..8 {
            let o = b.octant(i);
            assert!(b.contains(o.min) && b.contains(o.max));
        }
        let p = Vec3::new(1.5, 0.5, 1.5);
        let o = b.octant_of(p);
        assert!(b.octant(o).contains(p));
    }

    #[test]
    fn frustum_classifies_boxes() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_proj(&(proj * view));

        let inside = Aabb {
            min: Vec3::splat(-0.5),
            max: Vec3::splat(0.5),
        };
        assert_eq!(frustum.classify(&inside), Containment::Inside);

        let behind = Aabb {
            min: Vec3::new(-0.5, -0.5, 10.0),
            max: Vec3::new(0.5, 0.5, 11.0),
        };
        assert_eq!(frustum.classify(&behind), Containment::Outside);

        let straddling = Aabb {
            min: Vec3::new(-50.0, -0.5, -0.5),
            max: Vec3::new(0.0, 0.5, 0.5),
        };
        assert_eq!(frustum.classify(&straddling), Containment::Intersects);
    }

    #[test]
    fn pose_from_view_matches_construction() {
        let eye = Vec3::new(1.0, 2.0, 3.0);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let pose = CameraPose::from_view(&view);
        assert!((pose.position - eye).length() < 1e-5);
        assert!((pose.forward - (-eye).normalize()).length() < 1e-5);
        assert!(pose.depth_of(Vec3::ZERO) > 0.0);
    }
}
