// =============================================================================
// FRAME PIPELINE - Hello Window / Hello Triangle on explicit GPU sync
// =============================================================================
//
// One command allocator, one command list, one fence. Every frame is
// recorded, submitted, presented and fenced before the next one may reuse
// the allocator.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, resize, FPS)                         │
// │    └── Renderer (owns every GPU resource, drop order matters)   │
// │          └── FrameSynchronizer (per-frame protocol)             │
// │                ├── CommandRecorder (allocator + list)           │
// │                ├── PresentationCycle (swap chain ring)          │
// │                └── FrameFence (timeline counter)                │
// │          └── Scene (Window / Triangle sample)                   │
// │          └── Vulkan device + surface                            │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait until the allocator's last submission retired
// 2. Reset, record clears (+ triangle), close
// 3. Submit, present, re-query the back buffer index
// 4. Signal the fence (strict policy: wait for it right away)
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod scene;

use anyhow::{Context, Result};
use backend::buffer::{DepthBuffer, VertexBuffer, DEPTH_FORMAT};
use backend::swapchain::SwapchainDesc;
use backend::{PipelineState, RootSignature, Swapchain, Vulkan, VulkanDevice, VulkanQueue};
use config::Config;
use error::FrameResult;
use frame::{FrameReport, FrameSynchronizer};
use scene::{Scene, TriangleBindings};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, report) = Config::load();

    // Initialize logging, then replay what loading the config found
    init_logging(&config);
    report.log();
    log::debug!("Config: {:?}", config);
    log::info!("Starting frame pipeline: {}", config.graphics.sample.title());
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Back buffers: {}, vsync interval: {}, drain policy: {:?}",
        config.graphics.back_buffer_count,
        config.graphics.vsync_interval,
        config.graphics.drain_policy
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Release the GPU before reporting the outcome
    let failure = app.failure.take();
    drop(app);

    finish(failure)
}

/// Map the end of the session to the process result. Initialization and
/// frame failures were already logged by `App::fail`; like a normal quit
/// they exit with status 0.
fn finish(failure: Option<anyhow::Error>) -> Result<()> {
    match failure {
        Some(_) => log::warn!("Frame pipeline stopped after an error"),
        None => log::info!("Exited cleanly"),
    }
    Ok(())
}

/// Initialize logging, optionally piping everything into the log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    let mut file_error = None;
    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file);

        match file {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pipeline Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Could not open log file {}: {}", config.debug.log_file, e);
    }
}

// =============================================================================
// RENDERER
// =============================================================================

/// Every GPU resource of the running sample.
///
/// IMPORTANT: Field order is drop order. The synchronizer drains the GPU in
/// its own Drop, so everything declared after it is idle when destroyed.
/// The device (and the surface it owns) goes last.
struct Renderer {
    synchronizer: FrameSynchronizer<Vulkan>,
    scene: Scene<Vulkan>,
    _vertex_buffer: Option<VertexBuffer>,
    depth_buffer: Option<DepthBuffer>,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    fn new(config: &Config, window: &Window) -> Result<Self> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device + surface
        // ─────────────────────────────────────────────────────────────────────
        let device = VulkanDevice::new(&config.window.title, config.debug.validation_layers, window)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swap chain
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            Arc::clone(&device),
            SwapchainDesc {
                width: size.width,
                height: size.height,
                buffer_count: config.graphics.back_buffer_count,
                vsync_interval: config.graphics.vsync_interval,
            },
        )?;
        let extent = swapchain.extent;
        let color_format = swapchain.format;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Depth-stencil target
        // ─────────────────────────────────────────────────────────────────────
        let depth_buffer = if config.graphics.depth_stencil {
            Some(DepthBuffer::new(Arc::clone(&device), extent)?)
        } else {
            None
        };

        let mut scene = Scene::new(
            config.graphics.sample,
            config.graphics.clear_color,
            extent.width,
            extent.height,
        );
        scene.set_depth_stencil(depth_buffer.as_ref().map(DepthBuffer::view));

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Triangle pipeline + vertex data (Triangle sample only)
        // ─────────────────────────────────────────────────────────────────────
        let vertex_buffer = if config.graphics.sample.draws() {
            let root_signature = RootSignature::new(Arc::clone(&device))?;
            let pipeline = PipelineState::new(
                Arc::clone(&device),
                &root_signature,
                &config.graphics.shader_dir,
                color_format,
                depth_buffer.as_ref().map(|_| DEPTH_FORMAT),
            )?;

            let aspect = scene::aspect_ratio(extent.width, extent.height);
            let vertex_buffer = VertexBuffer::new(Arc::clone(&device), &scene::triangle_vertices(aspect))?;
            scene.set_triangle(TriangleBindings {
                root_signature,
                pipeline,
                vertex_buffer: vertex_buffer.view(),
            });
            Some(vertex_buffer)
        } else {
            None
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Frame synchronizer
        // ─────────────────────────────────────────────────────────────────────
        let queue = VulkanQueue::new(Arc::clone(&device));
        let synchronizer = FrameSynchronizer::new(&device, queue, swapchain, config.frame_settings())
            .context("Failed to create frame synchronizer")?;

        Ok(Self {
            synchronizer,
            scene,
            _vertex_buffer: vertex_buffer,
            depth_buffer,
            device,
        })
    }

    fn render(&mut self) -> FrameResult<FrameReport> {
        self.synchronizer.draw_frame(&self.scene.frame_context())
    }

    /// Drain, rebuild the swap chain for the new size and follow with the
    /// size-dependent resources.
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.synchronizer
            .rebuild_swap_chain(|swapchain| swapchain.recreate(width, height))
            .context("Failed to rebuild swap chain")?;

        let extent = self.synchronizer.presentation().swap_chain().extent;
        if self.depth_buffer.is_some() {
            self.scene.set_depth_stencil(None);
            self.depth_buffer = None;
            let depth_buffer = DepthBuffer::new(Arc::clone(&self.device), extent)?;
            self.scene.set_depth_stencil(Some(depth_buffer.view()));
            self.depth_buffer = Some(depth_buffer);
        }
        self.scene.resize(extent.width, extent.height);
        Ok(())
    }

    fn flush(&self) -> FrameResult<()> {
        self.synchronizer.flush()
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

pub struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // GPU (dropped before the window it presents to)
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer>,

    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    fullscreen_key: KeyCode,
    quit_key: KeyCode,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    is_minimized: bool,
    needs_resize: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FRAME TIMING
    // ─────────────────────────────────────────────────────────────────────────
    started: Instant,
    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,

    /// Set when initialization or a fatal frame error ends the loop.
    failure: Option<anyhow::Error>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            renderer: None,
            fullscreen_key: config.controls.fullscreen(),
            quit_key: config.controls.quit(),
            is_fullscreen: config.window.fullscreen,
            config,
            window: None,
            is_minimized: false,
            needs_resize: false,
            started: now,
            last_frame_time: now,
            last_fps_update: now,
            frame_count: 0,
            failure: None,
        }
    }

    fn title(&self) -> String {
        format!("{} - {}", self.config.window.title, self.config.graphics.sample.title())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.failure = Some(error);
        event_loop.exit();
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    fn recreate_swapchain(&mut self) -> Result<()> {
        let size = match self.window {
            Some(ref window) => window.inner_size(),
            None => return Ok(()),
        };

        // Can't create a zero-sized swap chain; wait for a real size
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }

        if let Some(ref mut renderer) = self.renderer {
            renderer.resize(size.width, size.height)?;
        }
        self.needs_resize = false;
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Returns whether a frame was presented.
    pub fn render_frame(&mut self) -> Result<bool> {
        // Skip rendering if minimized
        if self.is_minimized {
            return Ok(false);
        }

        // Handle resize if needed
        if self.needs_resize {
            self.recreate_swapchain()?;
            if self.is_minimized {
                return Ok(false);
            }
        }

        let renderer = self.renderer.as_mut().context("Renderer not initialized")?;

        match renderer.render() {
            Ok(report) => {
                log::trace!(
                    "Frame {} on back buffer {} (fence {}, completed {})",
                    report.frame,
                    report.back_buffer,
                    report.fence_value,
                    report.completed_value
                );
                Ok(true)
            }
            // The swap chain went stale under us: rebuild before the next frame
            Err(e) if !e.is_fatal() => {
                log::warn!("{}; rebuilding swap chain", e);
                self.needs_resize = true;
                Ok(false)
            }
            Err(e) => Err(e).context("Frame failed"),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                // Exit fullscreen
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FRAME TIMING
    // =========================================================================

    pub fn update_timing(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if !self.config.debug.show_fps {
            return;
        }

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.title(),
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }
            log::debug!(
                "{:.0} FPS after {:.1}s",
                fps,
                now.duration_since(self.started).as_secs_f32()
            );

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(self.title())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        // Set fullscreen if configured
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize renderer"));
                return;
            }
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.flush() {
                        log::error!("Failed to drain GPU on close: {}", e);
                    }
                }
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_timing(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        if key == self.quit_key {
                            log::info!("{:?} pressed, exiting...", key);
                            event_loop.exit();
                        } else if key == self.fullscreen_key {
                            self.toggle_fullscreen();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up GPU resources...");
        // The synchronizer drains in Drop; the rest follows field order
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
