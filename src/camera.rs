// First-person camera
//
// Yaw around world Y, then pitch around the camera's X axis. The uniform
// block matches `CameraBlock` in shaders/mesh.{vert,frag}.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

use crate::config::CameraConfig;

/// Pitch stays just short of straight up/down
const PITCH_LIMIT: f32 = 1.57;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub world: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub normal: Mat4,
    pub position: Vec3,
    _pad: f32,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    /// Radians, x = yaw, y = pitch
    pub rotation: Vec2,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            rotation: Vec2::ZERO,
        }
    }
}

impl Camera {
    /// Camera to world
    pub fn transform(&self) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_rotation_y(self.rotation.x)
            * Mat4::from_rotation_x(self.rotation.y)
    }

    pub fn right(&self) -> Vec3 {
        self.transform().x_axis.truncate()
    }

    pub fn up(&self) -> Vec3 {
        self.transform().y_axis.truncate()
    }

    pub fn forward(&self) -> Vec3 {
        -self.transform().z_axis.truncate()
    }

    /// Positive x turns right, positive y looks down
    pub fn look(&mut self, delta: Vec2) {
        self.rotation -= delta;
        self.rotation.y = self.rotation.y.clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    /// Moves along the camera's own axes (x right, y up, z forward). The step
    /// never exceeds one unit.
    pub fn move_local(&mut self, amount: Vec3) {
        let step = self.right() * amount.x + self.up() * amount.y + self.forward() * amount.z;
        self.position += step.clamp_length_max(1.0);
    }

    pub fn uniform(&self, aspect: f32, config: &CameraConfig) -> CameraUniform {
        let world = Mat4::IDENTITY;

        let mut projection = Mat4::perspective_rh(
            config.fov_degrees.to_radians(),
            aspect,
            config.near,
            config.far,
        );
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        CameraUniform {
            world,
            view: self.transform().inverse(),
            projection,
            normal: world.inverse().transpose(),
            position: self.position,
            _pad: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 4 * 64 + 16);
        assert_eq!(std::mem::offset_of!(CameraUniform, position), 256);
    }

    #[test]
    fn uniform_bytes_end_with_camera_position() {
        let camera = Camera::default();
        let uniform = camera.uniform(16.0 / 9.0, &CameraConfig::default());
        let bytes = bytemuck::bytes_of(&uniform);

        assert_eq!(bytes.len(), 272);
        assert_eq!(&bytes[264..268], &5.0f32.to_ne_bytes());
        assert_eq!(&bytes[268..272], &0.0f32.to_ne_bytes());
    }

    #[test]
    fn default_camera_looks_down_negative_z() {
        let camera = Camera::default();

        assert_eq!(camera.position, Vec3::new(0.0, 0.0, 5.0));
        assert_relative_eq!(camera.forward().z, -1.0);
        assert_relative_eq!(camera.right().x, 1.0);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();

        camera.look(Vec2::new(0.0, -10.0));
        assert_relative_eq!(camera.rotation.y, PITCH_LIMIT);

        camera.look(Vec2::new(0.0, 20.0));
        assert_relative_eq!(camera.rotation.y, -PITCH_LIMIT);
    }

    #[test]
    fn moving_right_after_turning_right() {
        let mut camera = Camera::default();
        // quarter turn to the right: forward becomes +X
        camera.look(Vec2::new(std::f32::consts::FRAC_PI_2, 0.0));

        camera.move_local(Vec3::new(0.0, 0.0, 0.5));

        assert_relative_eq!(camera.position.x, 0.5, epsilon = 1e-5);
        assert_relative_eq!(camera.position.z, 5.0, epsilon = 1e-5);
    }

    #[test]
    fn step_is_limited_to_one_unit() {
        let mut camera = Camera::default();

        camera.move_local(Vec3::new(0.0, 0.0, 100.0));

        assert_relative_eq!(camera.position.z, 4.0, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let config = CameraConfig::default();
        let uniform = Camera::default().uniform(16.0 / 9.0, &config);

        assert!(uniform.projection.y_axis.y < 0.0);
        assert_eq!(uniform.world, Mat4::IDENTITY);
        assert_eq!(uniform.normal, Mat4::IDENTITY);
        // the origin sits straight ahead of the default camera
        let view_space = uniform.view.transform_point3(Vec3::ZERO);
        assert_relative_eq!(view_space.z, -5.0, epsilon = 1e-5);
    }
}
