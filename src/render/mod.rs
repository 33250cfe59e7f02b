//! GPU render/damage stage.
//!
//! Every captured frame — whether it arrived as host-memory pixels (SHM) or
//! as dma-buf planes — is turned into one ordinary RGBA8 2D "working"
//! texture via a shader pass (plain-texture shader for SHM, the
//! `samplerExternalOES`-sampling dma-buf shader for DMA-BUF, blitted into an
//! offscreen framebuffer). That single code path is then shared by the
//! damage estimator and `copy_pixels`, instead of duplicating both for two
//! frame shapes.

pub mod egl;
mod shaders;

use glow::HasContext;

use crate::damage::{self, DamageRegion};
use crate::error::{CoreError, CoreResult};

use self::egl::EglContext;

pub struct GpuRenderer {
    egl: EglContext,
    gl: glow::Context,
    width: u32,
    height: u32,
    vao: glow::VertexArray,
    #[allow(dead_code)]
    quad_vbo: glow::Buffer,
    plain_program: glow::Program,
    dmabuf_program: glow::Program,
    damage_program: glow::Program,
    working_fbo: glow::Framebuffer,
    downsample_fbo: glow::Framebuffer,
    downsample_tex: glow::Texture,
    last_texture: Option<glow::Texture>,
    last_damage: DamageRegion,
    flip_y: bool,
    shm_upload_format: GlPixelFormat,
}

/// The GL upload format used for SHM pixel uploads, configurable since true
/// wire-format detection isn't attempted. `Bgra` matches
/// `WL_SHM_FORMAT_ARGB8888`/`XRGB8888` on little-endian hosts (the
/// overwhelmingly common case) and is the default; anything else the config
/// doesn't recognise falls back to it rather than guessing silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlPixelFormat {
    Bgra,
    Rgba,
}

impl GlPixelFormat {
    fn gl_format(self) -> u32 {
        match self {
            GlPixelFormat::Bgra => glow::BGRA,
            GlPixelFormat::Rgba => glow::RGBA,
        }
    }

    pub fn from_config_str(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RGBA8888" | "RGBA" => GlPixelFormat::Rgba,
            _ => GlPixelFormat::Bgra,
        }
    }
}

const QUAD_VERTICES: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

impl GpuRenderer {
    pub fn new(width: u32, height: u32, shm_upload_format: GlPixelFormat) -> CoreResult<Self> {
        let (egl, gl) = EglContext::new(width as i32, height as i32)?;

        let plain_program = shaders::compile_program(&gl, shaders::VERTEX_SHADER, shaders::PLAIN_FRAGMENT_SHADER)?;
        let dmabuf_program =
            shaders::compile_program(&gl, shaders::VERTEX_SHADER, shaders::DMABUF_FRAGMENT_SHADER)?;
        let damage_program = shaders::compile_program(&gl, shaders::VERTEX_SHADER, shaders::DAMAGE_FRAGMENT_SHADER)?;

        let (vao, quad_vbo) = unsafe {
            let vao = gl
                .create_vertex_array()
                .map_err(|e| CoreError::RenderFailure(format!("create_vertex_array: {e}")))?;
            gl.bind_vertex_array(Some(vao));

            let vbo = gl
                .create_buffer()
                .map_err(|e| CoreError::RenderFailure(format!("create_buffer: {e}")))?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytemuck::cast_slice(&QUAD_VERTICES), glow::STATIC_DRAW);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 0, 0);
            gl.enable_vertex_attrib_array(0);

            (vao, vbo)
        };

        let working_fbo = unsafe {
            gl.create_framebuffer()
                .map_err(|e| CoreError::RenderFailure(format!("create_framebuffer: {e}")))?
        };

        let tiles_wide = damage::tiles_covering(width);
        let tiles_high = damage::tiles_covering(height);
        let (downsample_fbo, downsample_tex) = unsafe {
            create_render_target(&gl, tiles_wide, tiles_high)
                .map_err(|e| CoreError::RenderFailure(format!("downsample target: {e}")))?
        };

        Ok(Self {
            egl,
            gl,
            width,
            height,
            vao,
            quad_vbo,
            plain_program,
            dmabuf_program,
            damage_program,
            working_fbo,
            downsample_fbo,
            downsample_tex,
            last_texture: None,
            last_damage: DamageRegion::default(),
            flip_y: true,
            shm_upload_format,
        })
    }

    /// Honours the screencopy `flags` event's Y-invert bit instead of
    /// assuming it. The Wayland glue calls this from the `flags` event
    /// handler.
    pub fn set_y_inverted(&mut self, inverted: bool) {
        self.flip_y = inverted;
    }

    pub fn resize(&mut self, width: u32, height: u32) -> CoreResult<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        self.width = width;
        self.height = height;
        let tiles_wide = damage::tiles_covering(width);
        let tiles_high = damage::tiles_covering(height);
        unsafe {
            self.gl.delete_framebuffer(self.downsample_fbo);
            self.gl.delete_texture(self.downsample_tex);
            let (fbo, tex) = create_render_target(&self.gl, tiles_wide, tiles_high)
                .map_err(|e| CoreError::RenderFailure(format!("resize downsample target: {e}")))?;
            self.downsample_fbo = fbo;
            self.downsample_tex = tex;
            if let Some(tex) = self.last_texture.take() {
                self.gl.delete_texture(tex);
            }
        }
        Ok(())
    }

    /// Imports the frame's planes as an external-texture image, blits it
    /// through the dma-buf shader into the working 2D texture, runs the
    /// damage pass against the previous texture, and retains the new
    /// texture.
    pub fn render_dmabuf_frame(
        &mut self,
        width: u32,
        height: u32,
        fourcc: drm_fourcc::DrmFourcc,
        planes: &[crate::capture::DmabufPlane],
    ) -> CoreResult<()> {
        self.resize(width, height)?;

        let image = self
            .egl
            .import_dmabuf_image(width, height, fourcc as u32, planes)?;

        let ext_tex = unsafe {
            let tex = self
                .gl
                .create_texture()
                .map_err(|e| CoreError::RenderFailure(format!("create_texture: {e}")))?;
            self.gl.bind_texture(egl::TEXTURE_EXTERNAL_OES, Some(tex));
            self.egl.bind_image_to_external_texture(&image);
            tex
        };
        // The GL texture keeps its own reference once the image is bound;
        // the EGLImage itself is not needed past this point.
        self.egl.destroy_image(image);

        let working_tex = unsafe { self.new_working_texture()? };
        unsafe {
            self.blit(self.dmabuf_program, egl::TEXTURE_EXTERNAL_OES, ext_tex, working_tex, false)?;
            self.gl.delete_texture(ext_tex);
        }

        self.finish_frame(working_tex)
    }

    /// Uploads host-memory pixels into an ordinary 2D texture honouring
    /// `stride` via `UNPACK_ROW_LENGTH`, generates mips, and blits through
    /// the plain-texture shader.
    pub fn render_framebuffer(&mut self, pixels: &[u8], width: u32, height: u32, stride: u32) -> CoreResult<()> {
        self.resize(width, height)?;

        let src_tex = unsafe {
            let tex = self
                .gl
                .create_texture()
                .map_err(|e| CoreError::RenderFailure(format!("create_texture: {e}")))?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);

            let row_length_px = (stride / 4) as i32;
            self.gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, row_length_px);
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width as i32,
                height as i32,
                0,
                self.shm_upload_format.gl_format(),
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
            self.gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
            self.gl.generate_mipmap(glow::TEXTURE_2D);
            tex
        };

        let working_tex = unsafe { self.new_working_texture()? };
        unsafe {
            self.blit(self.plain_program, glow::TEXTURE_2D, src_tex, working_tex, self.flip_y)?;
            self.gl.delete_texture(src_tex);
        }

        self.finish_frame(working_tex)
    }

    unsafe fn new_working_texture(&self) -> CoreResult<glow::Texture> {
        let tex = self
            .gl
            .create_texture()
            .map_err(|e| CoreError::RenderFailure(format!("create_texture: {e}")))?;
        self.gl.bind_texture(glow::TEXTURE_2D, Some(tex));
        self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
        self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
        self.gl.tex_image_2d(
            glow::TEXTURE_2D,
            0,
            glow::RGBA8 as i32,
            self.width as i32,
            self.height as i32,
            0,
            glow::RGBA,
            glow::UNSIGNED_BYTE,
            glow::PixelUnpackData::Slice(None),
        );
        Ok(tex)
    }

    /// Renders `src_tex` (bound to `src_target`, `GL_TEXTURE_2D` or
    /// `GL_TEXTURE_EXTERNAL_OES`) into `dst_tex` via `program`'s fullscreen
    /// quad pass.
    unsafe fn blit(
        &self,
        program: glow::Program,
        src_target: u32,
        src_tex: glow::Texture,
        dst_tex: glow::Texture,
        flip_y: bool,
    ) -> CoreResult<()> {
        self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.working_fbo));
        self.gl.framebuffer_texture_2d(
            glow::FRAMEBUFFER,
            glow::COLOR_ATTACHMENT0,
            glow::TEXTURE_2D,
            Some(dst_tex),
            0,
        );
        if self.gl.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
            return Err(CoreError::RenderFailure("working framebuffer incomplete".into()));
        }

        self.gl.viewport(0, 0, self.width as i32, self.height as i32);
        self.gl.use_program(Some(program));
        self.gl.active_texture(glow::TEXTURE0);
        self.gl.bind_texture(src_target, Some(src_tex));
        if let Some(loc) = self.gl.get_uniform_location(program, "u_tex") {
            self.gl.uniform_1_i32(Some(&loc), 0);
        }
        if let Some(loc) = self.gl.get_uniform_location(program, "u_flip_y") {
            self.gl.uniform_1_i32(Some(&loc), flip_y as i32);
        }
        self.gl.bind_vertex_array(Some(self.vao));
        self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);

        self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        Ok(())
    }

    /// Runs the damage pass against the previous texture (if any), then
    /// supersedes `last_texture` with the freshly rendered one, deleting
    /// the one it replaces.
    fn finish_frame(&mut self, new_texture: glow::Texture) -> CoreResult<()> {
        self.last_damage = match self.last_texture {
            Some(prev) => self.compute_damage(new_texture, prev)?,
            None => DamageRegion::default(),
        };

        if let Some(prev) = self.last_texture.replace(new_texture) {
            unsafe { self.gl.delete_texture(prev) };
        }
        Ok(())
    }

    /// Downsamples both textures through the damage shader to a
    /// `(W/32) x (H/32)` target, reads it back, and turns non-zero texels
    /// into tile-aligned rectangles.
    fn compute_damage(&self, current: glow::Texture, previous: glow::Texture) -> CoreResult<DamageRegion> {
        let tiles_wide = damage::tiles_covering(self.width);
        let tiles_high = damage::tiles_covering(self.height);

        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.downsample_fbo));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(self.downsample_tex),
                0,
            );
            self.gl.viewport(0, 0, tiles_wide as i32, tiles_high as i32);
            self.gl.use_program(Some(self.damage_program));

            self.gl.active_texture(glow::TEXTURE0);
            self.gl.bind_texture(glow::TEXTURE_2D, Some(current));
            if let Some(loc) = self.gl.get_uniform_location(self.damage_program, "u_current") {
                self.gl.uniform_1_i32(Some(&loc), 0);
            }

            self.gl.active_texture(glow::TEXTURE1);
            self.gl.bind_texture(glow::TEXTURE_2D, Some(previous));
            if let Some(loc) = self.gl.get_uniform_location(self.damage_program, "u_previous") {
                self.gl.uniform_1_i32(Some(&loc), 1);
            }

            self.gl.bind_vertex_array(Some(self.vao));
            self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);

            let mut rgba = vec![0u8; (tiles_wide * tiles_high * 4) as usize];
            self.gl.read_pixels(
                0,
                0,
                tiles_wide as i32,
                tiles_high as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(&mut rgba)),
            );
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);

            let changed: Vec<u8> = rgba.chunks_exact(4).map(|px| px[0]).collect();
            Ok(damage::region_from_tile_buffer(tiles_wide, tiles_high, &changed))
        }
    }

    /// Reads a horizontal band of the current working framebuffer into
    /// `dst`, native read format (RGBA8/u8).
    pub fn copy_pixels(&self, dst: &mut [u8], y: u32, height: u32) -> CoreResult<()> {
        let Some(tex) = self.last_texture else {
            return Err(CoreError::RenderFailure("copy_pixels before any frame was rendered".into()));
        };
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.working_fbo));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(tex),
                0,
            );
            self.gl.read_pixels(
                0,
                y as i32,
                self.width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(dst)),
            );
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        Ok(())
    }

    /// Reads exactly the rectangle `rect` out of the current working
    /// texture, tightly packed (`rect.w * rect.h * 4` bytes) — what
    /// `rfb::wire::encode_framebuffer_update`'s `pixels_for` callback needs
    /// per damage rect, as opposed to `copy_pixels`'s full-width band.
    pub fn copy_rect_pixels(&self, rect: &crate::damage::Rect) -> CoreResult<Vec<u8>> {
        let Some(tex) = self.last_texture else {
            return Err(CoreError::RenderFailure("copy_rect_pixels before any frame was rendered".into()));
        };
        let mut dst = vec![0u8; (rect.w * rect.h * 4) as usize];
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.working_fbo));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(tex),
                0,
            );
            self.gl.read_pixels(
                rect.x as i32,
                rect.y as i32,
                rect.w as i32,
                rect.h as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(&mut dst)),
            );
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        Ok(dst)
    }

    pub fn current_damage(&self) -> &DamageRegion {
        &self.last_damage
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

unsafe fn create_render_target(
    gl: &glow::Context,
    width: u32,
    height: u32,
) -> Result<(glow::Framebuffer, glow::Texture), String> {
    let tex = gl.create_texture().map_err(|e| format!("create_texture: {e}"))?;
    gl.bind_texture(glow::TEXTURE_2D, Some(tex));
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
    gl.tex_image_2d(
        glow::TEXTURE_2D,
        0,
        glow::RGBA8 as i32,
        width.max(1) as i32,
        height.max(1) as i32,
        0,
        glow::RGBA,
        glow::UNSIGNED_BYTE,
        glow::PixelUnpackData::Slice(None),
    );

    let fbo = gl.create_framebuffer().map_err(|e| format!("create_framebuffer: {e}"))?;
    gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
    gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(tex), 0);
    gl.bind_framebuffer(glow::FRAMEBUFFER, None);

    Ok((fbo, tex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gl_pixel_format_defaults_to_bgra_for_unknown_strings() {
        assert_eq!(GlPixelFormat::from_config_str("nonsense"), GlPixelFormat::Bgra);
        assert_eq!(GlPixelFormat::from_config_str("RGBA8888"), GlPixelFormat::Rgba);
    }

    #[test]
    fn quad_covers_the_full_clip_space() {
        // Sanity check on the constant rather than a GL call: the
        // fullscreen-quad vertices span [-1, 1] on both axes.
        let xs: Vec<f32> = QUAD_VERTICES.iter().step_by(2).copied().collect();
        let ys: Vec<f32> = QUAD_VERTICES.iter().skip(1).step_by(2).copied().collect();
        assert!(xs.contains(&-1.0) && xs.contains(&1.0));
        assert!(ys.contains(&-1.0) && ys.contains(&1.0));
    }
}
