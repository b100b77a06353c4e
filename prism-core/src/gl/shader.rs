//! GLSL ES 3.10 programs and the BT.709 conversion they bake in.
//!
//! The YUV→RGB matrix and offsets are compile-time constants in the fragment
//! source. The Rust constants below are the same numbers; the tests hold the
//! two against a high-precision reference conversion so neither can drift.

use glow::HasContext;

use super::GlError;

/// Vertex stage shared by every video quad. `a_corner` is the unit quad in
/// [0,1]^2; `u_transform` is the keystone matrix composed with the stream's
/// layout, producing top-left-origin normalized screen coordinates.
pub const VIDEO_VERTEX: &str = r#"#version 310 es
layout(location = 0) in vec2 a_corner;
uniform mat3 u_transform;
out vec2 v_tex;

void main() {
    vec3 p = u_transform * vec3(a_corner, 1.0);
    vec2 pos = p.xy / p.z;
    gl_Position = vec4(pos.x * 2.0 - 1.0, 1.0 - pos.y * 2.0, 0.0, 1.0);
    v_tex = a_corner;
}
"#;

/// BT.709 TV-range sampling of three R8 planes. `u_valid_scale` maps quad
/// coordinates onto the valid region of the padded textures.
pub const VIDEO_FRAGMENT: &str = r#"#version 310 es
precision highp float;

uniform sampler2D u_plane_y;
uniform sampler2D u_plane_u;
uniform sampler2D u_plane_v;
uniform vec2 u_valid_scale;

in vec2 v_tex;
out vec4 frag_color;

const mat3 BT709_TV = mat3(
    1.164384, 1.164384, 1.164384,
    0.000000, -0.213249, 2.112402,
    1.792741, -0.532909, 0.000000);
const vec3 YUV_OFFSET = vec3(0.062745, 0.501961, 0.501961);

void main() {
    vec2 t = v_tex * u_valid_scale;
    vec3 yuv = vec3(
        texture(u_plane_y, t).r,
        texture(u_plane_u, t).r,
        texture(u_plane_v, t).r) - YUV_OFFSET;
    frag_color = vec4(clamp(BT709_TV * yuv, 0.0, 1.0), 1.0);
}
"#;

/// Flat-color quad used by the overlay draw primitive.
pub const OVERLAY_VERTEX: &str = r#"#version 310 es
layout(location = 0) in vec2 a_corner;
uniform vec4 u_rect;

void main() {
    vec2 pos = u_rect.xy + a_corner * u_rect.zw;
    gl_Position = vec4(pos.x * 2.0 - 1.0, 1.0 - pos.y * 2.0, 0.0, 1.0);
}
"#;

pub const OVERLAY_FRAGMENT: &str = r#"#version 310 es
precision mediump float;
uniform vec4 u_color;
out vec4 frag_color;

void main() {
    frag_color = u_color;
}
"#;

/// The fragment shader's constants, host-side.
pub mod bt709 {
    /// Column-major 3x3 matrix, matching the GLSL `mat3` literal.
    pub const MATRIX: [f32; 9] = [
        1.164384, 1.164384, 1.164384, // Y column
        0.000000, -0.213249, 2.112402, // U column
        1.792741, -0.532909, 0.000000, // V column
    ];

    /// TV-range offsets: 16/255 for luma, 128/255 for chroma.
    pub const OFFSET: [f32; 3] = [0.062745, 0.501961, 0.501961];

    /// Exactly the arithmetic the fragment shader performs, on normalized
    /// samples. Used by the conversion tests.
    pub fn convert(y: f32, u: f32, v: f32) -> [f32; 3] {
        let yuv = [y - OFFSET[0], u - OFFSET[1], v - OFFSET[2]];
        let mut rgb = [0.0f32; 3];
        for (row, out) in rgb.iter_mut().enumerate() {
            *out = (MATRIX[row] * yuv[0] + MATRIX[3 + row] * yuv[1] + MATRIX[6 + row] * yuv[2])
                .clamp(0.0, 1.0);
        }
        rgb
    }
}

/// Compile and link one program.
pub fn link_program(
    gl: &glow::Context,
    vertex: &str,
    fragment: &str,
) -> Result<glow::Program, GlError> {
    unsafe {
        let program = gl.create_program().map_err(GlError::Shader)?;
        let mut shaders = Vec::with_capacity(2);
        for (kind, source) in [(glow::VERTEX_SHADER, vertex), (glow::FRAGMENT_SHADER, fragment)] {
            let shader = gl.create_shader(kind).map_err(GlError::Shader)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(GlError::Shader(log));
            }
            gl.attach_shader(program, shader);
            shaders.push(shader);
        }
        gl.link_program(program);
        for shader in shaders {
            gl.detach_shader(program, shader);
            gl.delete_shader(shader);
        }
        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(GlError::Shader(log));
        }
        Ok(program)
    }
}
