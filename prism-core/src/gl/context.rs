//! The engine's one GL context.
//!
//! Owns the EGL display/context/surface, the two programs (video quad and
//! overlay quad), the shared unit-quad vertex state, and the per-stream
//! plane textures' upload path. Touched only from the render thread.

use std::ffi::c_void;

use glow::HasContext;
use khronos_egl as egl;

use super::shader::{self, OVERLAY_FRAGMENT, OVERLAY_VERTEX, VIDEO_FRAGMENT, VIDEO_VERTEX};
use super::textures::PlaneTextures;
use super::GlError;
use crate::keystone::Mat3;

/// EGL_OPENGL_ES3_BIT from EGL_KHR_create_context.
const OPENGL_ES3_BIT: egl::Int = 0x0040;

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

struct VideoProgram {
    program: glow::Program,
    u_transform: Option<glow::UniformLocation>,
    u_valid_scale: Option<glow::UniformLocation>,
}

struct OverlayProgram {
    program: glow::Program,
    u_rect: Option<glow::UniformLocation>,
    u_color: Option<glow::UniformLocation>,
}

pub struct GlContext {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    gl: glow::Context,
    video: VideoProgram,
    overlay: OverlayProgram,
    quad_vao: glow::VertexArray,
    quad_vbo: glow::Buffer,
    width: u32,
    height: u32,
}

impl GlContext {
    /// Bring up EGL and GLES 3.1 on a GBM device + surface pair.
    ///
    /// # Safety
    ///
    /// `gbm_device` and `gbm_surface` must be live GBM handles that outlive
    /// the returned context.
    pub unsafe fn new(
        gbm_device: *mut c_void,
        gbm_surface: *mut c_void,
        width: u32,
        height: u32,
    ) -> Result<Self, GlError> {
        let egl_api = EglInstance::load_required().map_err(|e| GlError::Load(e.to_string()))?;

        let display = egl_api
            .get_display(gbm_device as egl::NativeDisplayType)
            .ok_or(GlError::NoDisplay)?;
        egl_api
            .initialize(display)
            .map_err(|e| GlError::Egl(format!("initialize: {e}")))?;
        egl_api
            .bind_api(egl::OPENGL_ES_API)
            .map_err(|e| GlError::Egl(format!("bind_api: {e}")))?;

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::RENDERABLE_TYPE,
            OPENGL_ES3_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            0,
            egl::NONE,
        ];
        let config = egl_api
            .choose_first_config(display, &config_attribs)
            .map_err(|e| GlError::Egl(format!("choose_config: {e}")))?
            .ok_or(GlError::NoConfig)?;

        let context_attribs = [
            egl::CONTEXT_CLIENT_VERSION,
            3,
            egl::NONE,
        ];
        let context = egl_api
            .create_context(display, config, None, &context_attribs)
            .map_err(|e| GlError::Egl(format!("create_context: {e}")))?;

        let surface = egl_api
            .create_window_surface(
                display,
                config,
                gbm_surface as egl::NativeWindowType,
                None,
            )
            .map_err(|e| GlError::Egl(format!("create_surface: {e}")))?;

        egl_api
            .make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|e| GlError::Egl(format!("make_current: {e}")))?;

        let gl = glow::Context::from_loader_function(|name| {
            egl_api
                .get_proc_address(name)
                .map(|f| f as *const c_void)
                .unwrap_or(std::ptr::null())
        });

        tracing::info!(
            vendor = %gl.get_parameter_string(glow::VENDOR),
            renderer = %gl.get_parameter_string(glow::RENDERER),
            version = %gl.get_parameter_string(glow::VERSION),
            "GL context up"
        );

        let video_prog = shader::link_program(&gl, VIDEO_VERTEX, VIDEO_FRAGMENT)?;
        let overlay_prog = shader::link_program(&gl, OVERLAY_VERTEX, OVERLAY_FRAGMENT)?;

        let video = VideoProgram {
            u_transform: gl.get_uniform_location(video_prog, "u_transform"),
            u_valid_scale: gl.get_uniform_location(video_prog, "u_valid_scale"),
            program: video_prog,
        };
        let overlay = OverlayProgram {
            u_rect: gl.get_uniform_location(overlay_prog, "u_rect"),
            u_color: gl.get_uniform_location(overlay_prog, "u_color"),
            program: overlay_prog,
        };

        // Sampler bindings never change: Y, U, V on units 0, 1, 2.
        gl.use_program(Some(video.program));
        for (i, name) in ["u_plane_y", "u_plane_u", "u_plane_v"].iter().enumerate() {
            if let Some(loc) = gl.get_uniform_location(video.program, name) {
                gl.uniform_1_i32(Some(&loc), i as i32);
            }
        }

        // Shared unit quad, triangle strip order.
        const QUAD: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let quad_vao = gl.create_vertex_array().map_err(GlError::Shader)?;
        let quad_vbo = gl.create_buffer().map_err(GlError::Shader)?;
        gl.bind_vertex_array(Some(quad_vao));
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(quad_vbo));
        let bytes =
            std::slice::from_raw_parts(QUAD.as_ptr() as *const u8, std::mem::size_of_val(&QUAD));
        gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytes, glow::STATIC_DRAW);
        gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 8, 0);
        gl.enable_vertex_attrib_array(0);
        gl.bind_vertex_array(None);

        gl.disable(glow::DEPTH_TEST);
        gl.disable(glow::BLEND);

        Ok(Self {
            egl: egl_api,
            display,
            context,
            surface,
            gl,
            video,
            overlay,
            quad_vao,
            quad_vbo,
            width,
            height,
        })
    }

    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn create_plane_textures(
        &self,
        padded_w: u32,
        padded_h: u32,
    ) -> Result<PlaneTextures, GlError> {
        PlaneTextures::new(&self.gl, padded_w, padded_h)
    }

    pub fn begin_frame(&self) {
        unsafe {
            self.gl.viewport(0, 0, self.width as i32, self.height as i32);
            self.gl.clear_color(0.0, 0.0, 0.0, 1.0);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    /// Draw one stream's textured quad under the given transform.
    pub fn draw_video(&self, textures: &PlaneTextures, transform: &Mat3) {
        if !textures.has_frame() {
            return;
        }
        unsafe {
            self.gl.use_program(Some(self.video.program));
            self.gl.bind_vertex_array(Some(self.quad_vao));
            textures.bind(&self.gl);
            self.gl.uniform_matrix_3_f32_slice(
                self.video.u_transform.as_ref(),
                false,
                &transform.to_gl(),
            );
            let scale = textures.valid_scale();
            self.gl
                .uniform_2_f32(self.video.u_valid_scale.as_ref(), scale[0], scale[1]);
            self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
        }
    }

    /// The overlay draw primitive: a flat quad at `rect` (x, y, w, h in
    /// normalized screen coordinates). Overlay content beyond this is the
    /// launcher's business.
    pub fn draw_overlay_quad(&self, rect: [f32; 4], color: [f32; 4]) {
        unsafe {
            self.gl.use_program(Some(self.overlay.program));
            self.gl.bind_vertex_array(Some(self.quad_vao));
            if color[3] < 1.0 {
                self.gl.enable(glow::BLEND);
                self.gl.blend_func(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA);
            }
            self.gl
                .uniform_4_f32(self.overlay.u_rect.as_ref(), rect[0], rect[1], rect[2], rect[3]);
            self.gl.uniform_4_f32(
                self.overlay.u_color.as_ref(),
                color[0],
                color[1],
                color[2],
                color[3],
            );
            self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            self.gl.disable(glow::BLEND);
        }
    }

    /// Finish the GL frame and queue it on the GBM surface. The display
    /// module locks the resulting front buffer and page-flips it.
    pub fn swap(&self) -> Result<(), GlError> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|e| GlError::Egl(format!("swap_buffers: {e}")))
    }
}

impl Drop for GlContext {
    fn drop(&mut self) {
        unsafe {
            self.gl.delete_vertex_array(self.quad_vao);
            self.gl.delete_buffer(self.quad_vbo);
            self.gl.delete_program(self.video.program);
            self.gl.delete_program(self.overlay.program);
        }
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
        tracing::debug!("GL context destroyed");
    }
}
