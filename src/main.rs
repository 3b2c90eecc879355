// =============================================================================
// EKKO RENDERER - minimal real-time Vulkan mesh viewer
// =============================================================================
//
// Loads the glTF meshes listed in config.toml and flies a first-person camera
// through them.
//
// FRAME FLOW:
// 1. Apply gathered input to the camera, write the camera block
// 2. Acquire swapchain image (blocks on the acquire fence)
// 3. Record render pass: bind pipeline + descriptor set, draw every mesh
// 4. Submit, present once the submission signals, wait on its fence
//
// CONTROLS: WASD move, Q/E down/up, Shift sprint, Tab toggle shading, Esc quit
//
// =============================================================================

mod asset;
mod backend;
mod camera;
mod config;
mod input;
mod mesh;
mod renderer;

use anyhow::{Context, Result};
use ash::vk;
use backend::command::{CommandBuffer, QueueKind};
use backend::pipeline::Pipeline;
use backend::shader::Material;
use camera::Camera;
use config::Config;
use input::PlayerController;
use mesh::Mesh;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use renderer::Renderer;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, DeviceId, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{CursorGrabMode, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Ekko renderer");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Ekko Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything that exists once the window does.
///
/// IMPORTANT: Field order matters for Drop! The renderer owns the surface, so
/// it has to go before the window.
struct RenderState {
    cmd: CommandBuffer,
    pipeline: Pipeline,
    _material: Material,
    meshes: Vec<Mesh>,
    renderer: Renderer,
    window: Arc<Window>,
}

impl RenderState {
    fn new(config: &Config, window: Arc<Window>) -> Result<Self> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let mut renderer = Renderer::new(config, display, window_handle)?;

        let material = renderer.create_material(
            &config.scene.vertex_shader,
            &config.scene.fragment_shader,
        )?;
        let pipeline = renderer.create_pipeline(&material)?;

        let mut meshes = Vec::with_capacity(config.scene.meshes.len());
        for mesh in &config.scene.meshes {
            let path = config.scene.asset_dir.join(&mesh.path);
            match renderer.create_mesh(&path, mesh.up_axis, mesh.uv_origin) {
                Ok(loaded) => meshes.push(loaded),
                Err(e) => log::error!("Skipping mesh {:?}: {:#}", path, e),
            }
        }
        if meshes.is_empty() {
            log::warn!("No meshes loaded, only the clear color will be visible");
        }

        let cmd = renderer.command_buffer(QueueKind::Graphics)?;

        Ok(Self {
            cmd,
            pipeline,
            _material: material,
            meshes,
            renderer,
            window,
        })
    }

    /// Records, submits and presents one frame, then waits for it
    fn draw(&mut self, shading: u32) -> Result<()> {
        let cmd = &mut self.cmd;
        let renderer = &mut self.renderer;

        cmd.begin(None)?;
        renderer.begin_render(cmd)?;

        self.pipeline.bind(cmd.buffer);
        renderer.bind_shader_resources(cmd, &self.pipeline);

        for mesh in &self.meshes {
            let constants = [mesh.texture, shading];
            self.pipeline.push_constants(
                cmd.buffer,
                vk::ShaderStageFlags::FRAGMENT,
                bytemuck::cast_slice(&constants),
            );
            mesh.draw(renderer.device(), cmd.buffer);
        }

        renderer.end_render(cmd);
        cmd.end(true)?;
        renderer.present(cmd)?;
        cmd.fence_wait()
    }
}

impl Drop for RenderState {
    fn drop(&mut self) {
        let textures: BTreeSet<PathBuf> = self
            .meshes
            .iter()
            .filter_map(|mesh| mesh.albedo.clone())
            .collect();

        for mesh in self.meshes.drain(..) {
            if let Err(e) = self.renderer.destroy_mesh(mesh) {
                log::error!("Failed to destroy mesh: {:?}", e);
            }
        }
        for path in textures {
            if let Err(e) = self.renderer.unload_texture(&path) {
                log::error!("Failed to unload texture {:?}: {:?}", path, e);
            }
        }
    }
}

struct App {
    config: Config,
    state: Option<RenderState>,
    camera: Camera,
    player: PlayerController,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            state: None,
            camera: Camera::default(),
            player: PlayerController::new(),
        }
    }

    fn render_frame(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        self.player.update(&mut self.camera, &self.config.camera);
        let uniform = self
            .camera
            .uniform(state.renderer.aspect(), &self.config.camera);
        state.renderer.update_camera(&uniform)?;

        state.draw(self.player.shading())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.as_ref() {
            let _ = state.renderer.device().wait_idle();
        }
        self.state = None;
        event_loop.exit();
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        // Fixed size: there is no swapchain recreation
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        // Mouse look: keep the cursor inside the window and hide it
        if let Err(e) = window
            .set_cursor_grab(CursorGrabMode::Confined)
            .or_else(|_| window.set_cursor_grab(CursorGrabMode::Locked))
        {
            log::warn!("Cursor grab unavailable: {}", e);
        }
        window.set_cursor_visible(false);

        match RenderState::new(&self.config, window) {
            Ok(state) => self.state = Some(state),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
            }
        }
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("Render error: {:?}", e);
                    self.shutdown(event_loop);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if key == KeyCode::Escape && event.state.is_pressed() {
                        log::info!("ESC pressed, exiting...");
                        self.shutdown(event_loop);
                        return;
                    }
                    self.player.key_event(key, event.state.is_pressed());
                }
            }

            _ => {}
        }
    }

    /// Raw mouse motion, unaffected by the cursor grab
    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _id: DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.player.mouse_motion(dx, dy);
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.as_ref() {
            state.window.request_redraw();
        }
    }
}
