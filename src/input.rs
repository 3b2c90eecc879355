// Player input
//
// Collects keyboard and raw mouse events between frames and turns them into
// one camera update per frame.

use glam::{Vec2, Vec3};
use winit::keyboard::KeyCode;

use crate::camera::Camera;
use crate::config::CameraConfig;

#[derive(Debug, Default)]
pub struct PlayerController {
    forward: bool,
    back: bool,
    left: bool,
    right: bool,
    up: bool,
    down: bool,
    sprint: bool,
    tab_held: bool,
    /// 0 = unlit, 1 = headlight
    shading: u32,
    mouse_delta: Vec2,
}

impl PlayerController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_event(&mut self, key: KeyCode, pressed: bool) {
        match key {
            KeyCode::KeyW => self.forward = pressed,
            KeyCode::KeyS => self.back = pressed,
            KeyCode::KeyA => self.left = pressed,
            KeyCode::KeyD => self.right = pressed,
            KeyCode::KeyE => self.up = pressed,
            KeyCode::KeyQ => self.down = pressed,
            KeyCode::ShiftLeft | KeyCode::ShiftRight => self.sprint = pressed,
            KeyCode::Tab => {
                // toggles on the press edge only, key repeat is ignored
                if pressed && !self.tab_held {
                    self.shading = (self.shading + 1) % 2;
                    log::debug!("Shading mode {}", self.shading);
                }
                self.tab_held = pressed;
            }
            _ => {}
        }
    }

    /// Raw device motion in pixels
    pub fn mouse_motion(&mut self, dx: f64, dy: f64) {
        self.mouse_delta += Vec2::new(dx as f32, dy as f32);
    }

    pub fn shading(&self) -> u32 {
        self.shading
    }

    /// Movement in camera space, before speed scaling
    fn direction(&self) -> Vec3 {
        let axis = |positive: bool, negative: bool| positive as i32 as f32 - negative as i32 as f32;
        Vec3::new(
            axis(self.right, self.left),
            axis(self.up, self.down),
            axis(self.forward, self.back),
        )
    }

    /// Applies everything gathered since the last call
    pub fn update(&mut self, camera: &mut Camera, config: &CameraConfig) {
        let speed = if self.sprint {
            config.sprint_speed
        } else {
            config.speed
        };

        camera.look(std::mem::take(&mut self.mouse_delta) * config.sensitivity);

        let direction = self.direction();
        if direction != Vec3::ZERO {
            camera.move_local(direction * speed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn tab_toggles_once_per_press() {
        let mut player = PlayerController::new();

        player.key_event(KeyCode::Tab, true);
        player.key_event(KeyCode::Tab, true);
        assert_eq!(player.shading(), 1);

        player.key_event(KeyCode::Tab, false);
        player.key_event(KeyCode::Tab, true);
        assert_eq!(player.shading(), 0);
    }

    #[test]
    fn opposite_keys_cancel() {
        let mut player = PlayerController::new();
        player.key_event(KeyCode::KeyW, true);
        player.key_event(KeyCode::KeyS, true);
        player.key_event(KeyCode::KeyD, true);

        assert_eq!(player.direction(), Vec3::new(1.0, 0.0, 0.0));

        player.key_event(KeyCode::KeyD, false);
        assert_eq!(player.direction(), Vec3::ZERO);
    }

    #[test]
    fn walking_forward_uses_walk_speed() {
        let config = CameraConfig::default();
        let mut camera = Camera::default();
        let mut player = PlayerController::new();
        player.key_event(KeyCode::KeyW, true);

        player.update(&mut camera, &config);

        assert_relative_eq!(camera.position.z, 5.0 - config.speed, epsilon = 1e-5);
    }

    #[test]
    fn sprinting_is_capped_at_one_unit_per_update() {
        let config = CameraConfig::default();
        let mut camera = Camera::default();
        let mut player = PlayerController::new();
        player.key_event(KeyCode::ShiftLeft, true);
        player.key_event(KeyCode::KeyE, true);

        player.update(&mut camera, &config);

        assert_relative_eq!(camera.position.y, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn mouse_motion_is_consumed_by_update() {
        let config = CameraConfig::default();
        let mut camera = Camera::default();
        let mut player = PlayerController::new();
        player.mouse_motion(100.0, 0.0);
        player.mouse_motion(50.0, 0.0);

        player.update(&mut camera, &config);
        assert_relative_eq!(camera.rotation.x, -150.0 * config.sensitivity);

        player.update(&mut camera, &config);
        assert_relative_eq!(camera.rotation.x, -150.0 * config.sensitivity);
    }
}
