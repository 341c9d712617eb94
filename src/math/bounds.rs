use glam::{Affine3A, Mat4, Vec3, Vec4};

/// Axis-aligned bounding box.
///
/// The default value is the *empty* box (`min = +MAX`, `max = -MAX`), which
/// is the identity element for [`BoundingBox::union`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(-f32::MAX),
    };

    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box enclosing all `points`. Empty input yields [`BoundingBox::EMPTY`].
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut bb = Self::EMPTY;
        for p in points {
            bb.extend_point(p);
        }
        bb
    }

    /// The AABB enclosing a sphere.
    #[must_use]
    pub fn from_sphere(sphere: &BoundingSphere) -> Self {
        let r = Vec3::splat(sphere.radius);
        Self {
            min: sphere.center - r,
            max: sphere.center + r,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline]
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    #[must_use]
    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    pub fn extend_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Grows `self` to enclose `other`. Invalid (empty) boxes are ignored.
    pub fn extend(&mut self, other: &BoundingBox) {
        if !other.is_valid() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[must_use]
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut out = *self;
        out.extend(other);
        out
    }

    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        if !self.is_valid() {
            return *self;
        }

        let corners = [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ];

        Self::from_points(corners.into_iter().map(|p| matrix.transform_point3(p)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    #[must_use]
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    #[must_use]
    pub fn from_bounding_box(bb: &BoundingBox) -> Self {
        Self {
            center: bb.center(),
            radius: bb.half_extent().length(),
        }
    }

    /// AABB-center sphere: center at the box midpoint, radius to the farthest point.
    pub fn from_points(points: &[Vec3]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        let center = BoundingBox::from_points(points.iter().copied()).center();
        let max_dist_sq = points
            .iter()
            .map(|p| p.distance_squared(center))
            .fold(0.0_f32, f32::max);
        Self {
            center,
            radius: max_dist_sq.sqrt(),
        }
    }

    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }

    /// Grows the sphere just enough to enclose `point`.
    ///
    /// A zero-radius sphere is treated as unset and snaps to the point.
    pub fn extend_point(&mut self, point: Vec3) {
        if self.radius == 0.0 {
            self.center = point;
            return;
        }
        let dist = self.center.distance(point);
        if dist > self.radius {
            let new_radius = (self.radius + dist) * 0.5;
            let k = (new_radius - self.radius) / dist;
            self.radius = new_radius;
            self.center += k * (point - self.center);
        }
    }

    pub fn extend(&mut self, other: &BoundingSphere) {
        if other.radius == 0.0 {
            return;
        }
        if self.radius == 0.0 {
            *self = *other;
            return;
        }

        let dist = self.center.distance(other.center);
        if dist + other.radius <= self.radius {
            return;
        }
        if dist + self.radius <= other.radius {
            *self = *other;
            return;
        }

        let new_radius = (self.radius + dist + other.radius) * 0.5;
        let dir = if dist > 0.0 {
            (other.center - self.center) / dist
        } else {
            Vec3::ZERO
        };
        self.center += dir * (new_radius - self.radius);
        self.radius = new_radius;
    }

    /// Transforms the center and scales the radius by the largest axis scale.
    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        let m = matrix.matrix3;
        let max_scale = m.x_axis.length().max(m.y_axis.length()).max(m.z_axis.length());
        Self {
            center: matrix.transform_point3(self.center),
            radius: self.radius * max_scale,
        }
    }
}

/// View frustum as six normalized planes (`ax + by + cz + d = 0`, normals inward).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6], // Left, Right, Bottom, Top, Near, Far
}

impl Frustum {
    pub const LEFT: usize = 0;
    pub const RIGHT: usize = 1;
    pub const BOTTOM: usize = 2;
    pub const TOP: usize = 3;
    pub const NEAR: usize = 4;
    pub const FAR: usize = 5;

    /// Gribb-Hartmann extraction for a `[0, 1]` depth range projection.
    #[must_use]
    pub fn from_matrix(m: Mat4) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];

        let mut planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[2],
            rows[3] - rows[2],
        ];

        for plane in &mut planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }

        Self { planes }
    }

    #[inline]
    #[must_use]
    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    #[inline]
    fn distance(plane: Vec4, point: Vec3) -> f32 {
        plane.truncate().dot(point) + plane.w
    }

    #[must_use]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|&p| Self::distance(p, point) >= 0.0)
    }

    #[must_use]
    pub fn intersects_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes
            .iter()
            .all(|&p| Self::distance(p, sphere.center) >= -sphere.radius)
    }

    /// Positive-vertex test: conservative, may report boxes near frustum corners as visible.
    #[must_use]
    pub fn intersects_box(&self, bb: &BoundingBox) -> bool {
        self.planes.iter().all(|&p| {
            let positive = Vec3::new(
                if p.x >= 0.0 { bb.max.x } else { bb.min.x },
                if p.y >= 0.0 { bb.max.y } else { bb.min.y },
                if p.z >= 0.0 { bb.max.z } else { bb.min.z },
            );
            Self::distance(p, positive) >= 0.0
        })
    }
}
