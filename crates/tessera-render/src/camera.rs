//! Camera producing the view and projection parts of [`UniformObjects`].

use crate::uniforms::UniformObjects;
use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            aspect,
            ..Self::default()
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Right-handed projection with Vulkan's 0..1 depth range and the Y axis
    /// flipped to match Vulkan clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Uniform record for drawing `model` at time `time`.
    pub fn uniforms(&self, time: f32, model: Mat4) -> UniformObjects {
        UniformObjects::new(time, self.projection_matrix(), self.view_matrix(), model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn origin_camera_has_identity_view() {
        let camera = Camera {
            position: Vec3::ZERO,
            ..Camera::default()
        };
        let view = camera.view_matrix().to_cols_array();
        let identity = Mat4::IDENTITY.to_cols_array();
        for (a, b) in view.iter().zip(identity.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn target_projects_to_center() {
        let camera = Camera::looking_at(Vec3::new(3.0, 2.0, 1.0), Vec3::ZERO, 1.0);
        let clip = camera.projection_matrix() * camera.view_matrix() * glam::Vec4::W;
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let above = camera.projection_matrix() * glam::Vec4::new(0.0, 1.0, -5.0, 1.0);
        assert!(above.y / above.w < 0.0);
    }

    #[test]
    fn uniforms_carry_matrices() {
        let camera = Camera::default();
        let model = Mat4::from_rotation_y(0.5);
        let uniforms = camera.uniforms(2.0, model);
        assert_eq!(uniforms.time, 2.0);
        assert_eq!(uniforms.model_matrix(), model);
        assert_eq!(uniforms.view_matrix(), camera.view_matrix());
        assert_eq!(uniforms.proj_matrix(), camera.projection_matrix());
    }
}
