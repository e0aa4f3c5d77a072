// Scene - vertex data and the two sample behaviours
//
// Both samples run through the same frame synchronizer. They differ only in
// the FrameContext they hand it: Window clears, Triangle clears and draws.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use serde::Deserialize;

use crate::backend::{Backend, ScissorRect, Viewport};
use crate::frame::{DrawCall, FrameContext};

/// sRGB LightSteelBlue, the default clear color.
pub const LIGHT_STEEL_BLUE: [f32; 4] = [0.690_196_1, 0.768_627_5, 0.870_588_3, 1.0];

pub const TRIANGLE_VERTEX_COUNT: u32 = 3;

/// Interleaved vertex: position (float3) then color (float4).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

const _: () = assert!(std::mem::size_of::<Vertex>() == 28);

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
    pub const COLOR_OFFSET: u32 = std::mem::size_of::<[f32; 3]>() as u32;

    fn new(position: Vec3, color: Vec4) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
        }
    }
}

/// The fixed triangle, scaled so it keeps its shape at any aspect ratio.
pub fn triangle_vertices(aspect_ratio: f32) -> [Vertex; TRIANGLE_VERTEX_COUNT as usize] {
    let scale = Vec3::new(1.0, aspect_ratio, 1.0);
    [
        Vertex::new(Vec3::new(0.0, 0.25, 0.0) * scale, Vec4::new(1.0, 0.0, 0.0, 1.0)),
        Vertex::new(Vec3::new(0.25, -0.25, 0.0) * scale, Vec4::new(0.0, 1.0, 0.0, 1.0)),
        Vertex::new(Vec3::new(-0.25, -0.25, 0.0) * scale, Vec4::new(0.0, 0.0, 1.0, 1.0)),
    ]
}

pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    if height == 0 {
        1.0
    } else {
        width as f32 / height as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sample {
    /// Clear the back buffer and depth-stencil every frame.
    Window,
    /// Clear, then draw the fixed colored triangle.
    Triangle,
}

impl Sample {
    pub fn title(self) -> &'static str {
        match self {
            Sample::Window => "Hello Window",
            Sample::Triangle => "Hello Triangle",
        }
    }

    pub fn draws(self) -> bool {
        self == Sample::Triangle
    }
}

/// Pipeline objects the Triangle sample binds each frame.
pub struct TriangleBindings<B: Backend> {
    pub root_signature: B::RootSignature,
    pub pipeline: B::PipelineState,
    pub vertex_buffer: B::VertexBufferView,
}

pub struct Scene<B: Backend> {
    sample: Sample,
    clear_color: [f32; 4],
    viewport: Viewport,
    scissor: ScissorRect,
    depth_stencil: Option<B::DepthStencilView>,
    triangle: Option<TriangleBindings<B>>,
}

impl<B: Backend> Scene<B> {
    pub fn new(sample: Sample, clear_color: [f32; 4], width: u32, height: u32) -> Self {
        Self {
            sample,
            clear_color,
            viewport: Viewport::full(width, height),
            scissor: ScissorRect::full(width, height),
            depth_stencil: None,
            triangle: None,
        }
    }

    pub fn set_depth_stencil(&mut self, view: Option<B::DepthStencilView>) {
        self.depth_stencil = view;
    }

    /// Ignored by the Window sample.
    pub fn set_triangle(&mut self, bindings: TriangleBindings<B>) {
        if self.sample.draws() {
            self.triangle = Some(bindings);
        } else {
            log::debug!("{} sample does not draw; dropping triangle bindings", self.sample.title());
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = Viewport::full(width, height);
        self.scissor = ScissorRect::full(width, height);
    }

    /// Per-frame recording input. The Triangle sample without bindings
    /// degrades to a clear.
    pub fn frame_context(&self) -> FrameContext<'_, B> {
        let draw = self.triangle.as_ref().map(|triangle| DrawCall {
            root_signature: &triangle.root_signature,
            pipeline: &triangle.pipeline,
            vertex_buffer: triangle.vertex_buffer,
        });

        FrameContext {
            viewport: self.viewport,
            scissor: self.scissor,
            clear_color: self.clear_color,
            depth_stencil: self.depth_stencil,
            draw,
        }
    }
}
