//! Math utilities and types
//!
//! Provides the math types used for instance placement and GPU records.

pub use nalgebra::{
    Vector3, Vector4,
    Matrix4,
    Quaternion,
    Unit,
};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,
    
    /// Rotation quaternion
    pub rotation: Quat,
    
    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a new identity transform
    pub fn identity() -> Self {
        Self::default()
    }
    
    /// Create a transform with only position
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
    
    /// Create a transform with position and uniform scale
    pub fn from_position_scale(position: Vec3, scale: f32) -> Self {
        Self {
            position,
            scale: Vec3::new(scale, scale, scale),
            ..Default::default()
        }
    }
    
    /// Convert to a transformation matrix
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
    
    /// Largest absolute scale factor
    ///
    /// Bounding spheres are scaled by this so non-uniform scale never
    /// under-estimates the extent of an instance.
    pub fn max_scale(&self) -> f32 {
        self.scale.x.abs().max(self.scale.y.abs()).max(self.scale.z.abs())
    }
}

/// Bounding sphere used for spatial nodes and instance extents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    /// Sphere center in world space
    pub center: Vec3,
    /// Sphere radius
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }
    
    /// Squared distance between the centers of two spheres
    pub fn center_distance_sq(&self, point: &Vec3) -> f32 {
        (self.center - point).norm_squared()
    }
    
    /// Check whether this sphere fully encloses another
    pub fn contains_sphere(&self, other: &BoundingSphere) -> bool {
        (other.center - self.center).norm() + other.radius <= self.radius + f32::EPSILON * self.radius.max(1.0)
    }
    
    /// Smallest sphere enclosing both spheres
    pub fn merged(&self, other: &BoundingSphere) -> BoundingSphere {
        let offset = other.center - self.center;
        let distance = offset.norm();
        
        if distance + other.radius <= self.radius {
            return *self;
        }
        if distance + self.radius <= other.radius {
            return *other;
        }
        
        let radius = (self.radius + distance + other.radius) * 0.5;
        let center = self.center + offset * ((radius - self.radius) / distance);
        BoundingSphere { center, radius }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    
    #[test]
    fn test_transform_matrix_translation() {
        let transform = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let origin = transform.to_matrix() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        
        assert_relative_eq!(origin.x, 1.0);
        assert_relative_eq!(origin.y, 2.0);
        assert_relative_eq!(origin.z, 3.0);
    }
    
    #[test]
    fn test_max_scale_uses_largest_axis() {
        let mut transform = Transform::identity();
        transform.scale = Vec3::new(0.5, -3.0, 2.0);
        assert_relative_eq!(transform.max_scale(), 3.0);
    }
    
    #[test]
    fn test_merged_disjoint_spheres() {
        let a = BoundingSphere::new(Vec3::new(-2.0, 0.0, 0.0), 1.0);
        let b = BoundingSphere::new(Vec3::new(2.0, 0.0, 0.0), 1.0);
        let merged = a.merged(&b);
        
        assert_relative_eq!(merged.radius, 3.0);
        assert_relative_eq!(merged.center.x, 0.0);
        assert!(merged.contains_sphere(&a));
        assert!(merged.contains_sphere(&b));
    }
    
    #[test]
    fn test_merged_keeps_enclosing_sphere() {
        let outer = BoundingSphere::new(Vec3::zeros(), 10.0);
        let inner = BoundingSphere::new(Vec3::new(1.0, 1.0, 1.0), 1.0);
        
        assert_eq!(outer.merged(&inner), outer);
        assert_eq!(inner.merged(&outer), outer);
    }
}
