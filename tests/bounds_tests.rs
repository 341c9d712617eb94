//! Bounding Volume Tests
//!
//! Tests for:
//! - BoundingBox construction, union identity, containment, transform
//! - BoundingSphere from points (AABB center), extension, transform
//! - Frustum plane extraction and sphere/box/point classification

use glam::{Affine3A, Mat4, Vec3};

use myth_loader::math::{BoundingBox, BoundingSphere, Frustum};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn vec3_approx(a: Vec3, b: Vec3) -> bool {
    approx(a.x, b.x) && approx(a.y, b.y) && approx(a.z, b.z)
}

// ============================================================================
// BoundingBox
// ============================================================================

#[test]
fn bbox_default_is_empty_and_invalid() {
    let bb = BoundingBox::default();
    assert_eq!(bb, BoundingBox::EMPTY);
    assert!(!bb.is_valid());
}

#[test]
fn bbox_from_points() {
    let bb = BoundingBox::from_points([
        Vec3::new(1.0, -2.0, 0.5),
        Vec3::new(-3.0, 4.0, 0.0),
        Vec3::new(0.0, 0.0, 2.0),
    ]);
    assert!(vec3_approx(bb.min, Vec3::new(-3.0, -2.0, 0.0)));
    assert!(vec3_approx(bb.max, Vec3::new(1.0, 4.0, 2.0)));
    assert!(vec3_approx(bb.center(), Vec3::new(-1.0, 1.0, 1.0)));
    assert!(vec3_approx(bb.size(), Vec3::new(4.0, 6.0, 2.0)));
}

#[test]
fn bbox_union_with_empty_is_identity() {
    let bb = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
    assert_eq!(bb.union(&BoundingBox::EMPTY), bb);
    assert_eq!(BoundingBox::EMPTY.union(&bb), bb);
}

#[test]
fn bbox_union_covers_both() {
    let a = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
    let b = BoundingBox::new(Vec3::ZERO, Vec3::splat(3.0));
    let u = a.union(&b);
    assert!(vec3_approx(u.min, Vec3::splat(-1.0)));
    assert!(vec3_approx(u.max, Vec3::splat(3.0)));
}

#[test]
fn bbox_contains_boundary() {
    let bb = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
    assert!(bb.contains(Vec3::ONE));
    assert!(bb.contains(Vec3::splat(0.5)));
    assert!(!bb.contains(Vec3::new(1.01, 0.5, 0.5)));
}

#[test]
fn bbox_from_sphere() {
    let bb = BoundingBox::from_sphere(&BoundingSphere::new(Vec3::new(1.0, 2.0, 3.0), 0.5));
    assert!(vec3_approx(bb.min, Vec3::new(0.5, 1.5, 2.5)));
    assert!(vec3_approx(bb.max, Vec3::new(1.5, 2.5, 3.5)));
}

#[test]
fn bbox_transform_rotation_grows_box() {
    let bb = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
    let rotated = bb.transform(&Affine3A::from_rotation_y(std::f32::consts::FRAC_PI_4));
    let r = std::f32::consts::SQRT_2;
    assert!(vec3_approx(rotated.min, Vec3::new(-r, -1.0, -r)));
    assert!(vec3_approx(rotated.max, Vec3::new(r, 1.0, r)));
}

#[test]
fn bbox_transform_keeps_empty_box() {
    let moved = BoundingBox::EMPTY.transform(&Affine3A::from_translation(Vec3::X));
    assert!(!moved.is_valid());
}

// ============================================================================
// BoundingSphere
// ============================================================================

#[test]
fn sphere_from_points_uses_aabb_center() {
    let points = [Vec3::ZERO, Vec3::new(4.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 0.0)];
    let s = BoundingSphere::from_points(&points);
    assert!(vec3_approx(s.center, Vec3::new(2.0, 0.5, 0.0)));
    let expected = Vec3::new(2.0, 0.5, 0.0).length();
    assert!(approx(s.radius, expected));
    for p in points {
        assert!(s.contains(p));
    }
}

#[test]
fn sphere_from_no_points_is_default() {
    assert_eq!(BoundingSphere::from_points(&[]), BoundingSphere::default());
}

#[test]
fn sphere_from_bounding_box() {
    let s = BoundingSphere::from_bounding_box(&BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0)));
    assert!(vec3_approx(s.center, Vec3::ZERO));
    assert!(approx(s.radius, 3.0_f32.sqrt()));
}

#[test]
fn sphere_extend_point_encloses_point() {
    let mut s = BoundingSphere::new(Vec3::ZERO, 1.0);
    s.extend_point(Vec3::new(3.0, 0.0, 0.0));
    assert!(approx(s.radius, 2.0));
    assert!(vec3_approx(s.center, Vec3::new(1.0, 0.0, 0.0)));
    assert!(s.contains(Vec3::new(-1.0, 0.0, 0.0)));
}

#[test]
fn sphere_extend_sphere() {
    let mut a = BoundingSphere::new(Vec3::ZERO, 1.0);
    a.extend(&BoundingSphere::new(Vec3::new(4.0, 0.0, 0.0), 1.0));
    assert!(approx(a.radius, 3.0));
    assert!(vec3_approx(a.center, Vec3::new(2.0, 0.0, 0.0)));

    // Already enclosed: unchanged.
    let before = a;
    a.extend(&BoundingSphere::new(Vec3::new(2.0, 0.0, 0.0), 0.5));
    assert_eq!(a, before);
}

#[test]
fn sphere_transform_scales_radius_by_max_axis() {
    let s = BoundingSphere::new(Vec3::X, 1.0);
    let m = Affine3A::from_scale_rotation_translation(
        Vec3::new(1.0, 3.0, 2.0),
        glam::Quat::IDENTITY,
        Vec3::new(0.0, 1.0, 0.0),
    );
    let t = s.transform(&m);
    assert!(approx(t.radius, 3.0));
    assert!(vec3_approx(t.center, Vec3::new(1.0, 1.0, 0.0)));
}

// ============================================================================
// Frustum
// ============================================================================

fn camera_frustum() -> Frustum {
    let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
    Frustum::from_matrix(proj)
}

#[test]
fn frustum_planes_are_normalized() {
    for plane in camera_frustum().planes() {
        assert!(approx(plane.truncate().length(), 1.0));
    }
}

#[test]
fn frustum_contains_point_in_front() {
    let f = camera_frustum();
    assert!(f.contains_point(Vec3::new(0.0, 0.0, -5.0)));
    assert!(!f.contains_point(Vec3::new(0.0, 0.0, 5.0)));
    assert!(!f.contains_point(Vec3::new(0.0, 0.0, -200.0)));
    assert!(!f.contains_point(Vec3::new(20.0, 0.0, -5.0)));
}

#[test]
fn frustum_sphere_straddling_plane_intersects() {
    let f = camera_frustum();
    // Center just outside the right plane (x = -z at 90° fov), radius reaches in.
    assert!(f.intersects_sphere(&BoundingSphere::new(Vec3::new(5.5, 0.0, -5.0), 1.0)));
    assert!(!f.intersects_sphere(&BoundingSphere::new(Vec3::new(10.0, 0.0, -5.0), 1.0)));
    assert!(!f.intersects_sphere(&BoundingSphere::new(Vec3::new(0.0, 0.0, 3.0), 1.0)));
}

#[test]
fn frustum_box_classification() {
    let f = camera_frustum();
    assert!(f.intersects_box(&BoundingBox::new(Vec3::new(-1.0, -1.0, -6.0), Vec3::new(1.0, 1.0, -4.0))));
    assert!(!f.intersects_box(&BoundingBox::new(Vec3::new(-1.0, -1.0, 2.0), Vec3::new(1.0, 1.0, 4.0))));
}
