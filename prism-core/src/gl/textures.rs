//! Per-stream YUV plane textures.
//!
//! Three single-channel 8-bit textures per stream, sized once to the pool's
//! padded dimensions. Uploads are sub-image updates with `UNPACK_ROW_LENGTH`
//! set to the source stride, so pool planes go to the GPU without any CPU
//! repacking.

use glow::HasContext;

use super::GlError;
use crate::pool::FrameSlot;

/// Y, U, V texture triple plus the padded geometry it was allocated for.
pub struct PlaneTextures {
    textures: [glow::Texture; 3],
    padded_w: u32,
    padded_h: u32,
    /// Valid dimensions of the last uploaded frame.
    valid_w: u32,
    valid_h: u32,
}

impl PlaneTextures {
    /// Allocate immutable storage for the padded dimensions.
    pub fn new(gl: &glow::Context, padded_w: u32, padded_h: u32) -> Result<Self, GlError> {
        let mut textures = Vec::with_capacity(3);
        let chroma_w = padded_w.div_ceil(2);
        let chroma_h = padded_h.div_ceil(2);
        for (w, h) in [
            (padded_w, padded_h),
            (chroma_w, chroma_h),
            (chroma_w, chroma_h),
        ] {
            unsafe {
                let tex = gl.create_texture().map_err(GlError::Texture)?;
                gl.bind_texture(glow::TEXTURE_2D, Some(tex));
                gl.tex_storage_2d(glow::TEXTURE_2D, 1, glow::R8, w as i32, h as i32);
                gl.tex_parameter_i32(
                    glow::TEXTURE_2D,
                    glow::TEXTURE_MIN_FILTER,
                    glow::LINEAR as i32,
                );
                gl.tex_parameter_i32(
                    glow::TEXTURE_2D,
                    glow::TEXTURE_MAG_FILTER,
                    glow::LINEAR as i32,
                );
                gl.tex_parameter_i32(
                    glow::TEXTURE_2D,
                    glow::TEXTURE_WRAP_S,
                    glow::CLAMP_TO_EDGE as i32,
                );
                gl.tex_parameter_i32(
                    glow::TEXTURE_2D,
                    glow::TEXTURE_WRAP_T,
                    glow::CLAMP_TO_EDGE as i32,
                );
                textures.push(tex);
            }
        }
        Ok(Self {
            textures: [textures[0], textures[1], textures[2]],
            padded_w,
            padded_h,
            valid_w: 0,
            valid_h: 0,
        })
    }

    /// Upload the three planes of a ready slot.
    pub fn upload(&mut self, gl: &glow::Context, slot: &FrameSlot) {
        let width = slot.geometry.width;
        let height = slot.geometry.height;
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        let dims = [(width, height), (chroma_w, chroma_h), (chroma_w, chroma_h)];

        unsafe {
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            for i in 0..3 {
                let plane = slot.plane(i);
                let (w, h) = dims[i];
                gl.bind_texture(glow::TEXTURE_2D, Some(self.textures[i]));
                gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, slot.geometry.strides[i] as i32);
                gl.tex_sub_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    0,
                    0,
                    w as i32,
                    h as i32,
                    glow::RED,
                    glow::UNSIGNED_BYTE,
                    glow::PixelUnpackData::Slice(plane.as_slice()),
                );
            }
            gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
        }
        self.valid_w = width;
        self.valid_h = height;
    }

    /// Bind Y, U, V to texture units 0, 1, 2.
    pub fn bind(&self, gl: &glow::Context) {
        unsafe {
            for (i, tex) in self.textures.iter().enumerate() {
                gl.active_texture(glow::TEXTURE0 + i as u32);
                gl.bind_texture(glow::TEXTURE_2D, Some(*tex));
            }
            gl.active_texture(glow::TEXTURE0);
        }
    }

    /// Ratio of valid to padded extent, for the sampling-scale uniform.
    pub fn valid_scale(&self) -> [f32; 2] {
        if self.valid_w == 0 || self.valid_h == 0 {
            return [0.0, 0.0];
        }
        [
            self.valid_w as f32 / self.padded_w as f32,
            self.valid_h as f32 / self.padded_h as f32,
        ]
    }

    pub fn has_frame(&self) -> bool {
        self.valid_w > 0 && self.valid_h > 0
    }

    /// Whether a slot with the given padded allocation still fits this
    /// storage; a pool reallocation forces a texture reallocation too.
    pub fn matches(&self, padded_w: u32, padded_h: u32) -> bool {
        self.padded_w == padded_w && self.padded_h == padded_h
    }

    pub fn destroy(&self, gl: &glow::Context) {
        unsafe {
            for tex in self.textures {
                gl.delete_texture(tex);
            }
        }
    }
}
