//! Offscreen EGL context bring-up and the `EGL_EXT_image_dma_buf_import`
//! glue the renderer needs to turn a DMA-BUF's planes into a GL texture.
//!
//! `khronos-egl` (loaded dynamically, since we don't want a hard link-time
//! dependency on `libEGL.so` for the SHM-only code path) covers core EGL
//! 1.4/1.5; the dma-buf import path (`eglCreateImageKHR` +
//! `glEGLImageTargetTexture2DOES`) is a vendor extension the crate does not
//! wrap, so those two entry points are resolved by hand through
//! `eglGetProcAddress`, the same pattern wlr screen-capture clients in the
//! wild use.

use std::ffi::{c_void, CString};
use std::os::fd::AsRawFd;

use khronos_egl as egl;

use crate::capture::DmabufPlane;
use crate::error::{CoreError, CoreResult};

/// `GL_TEXTURE_EXTERNAL_OES`, not part of glow's constant set because it is
/// an extension enum, not core GL.
pub const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;

const EGL_LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: egl::Int = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: egl::Int = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: egl::Int = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: egl::Int = 0x3274;
const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: egl::Int = 0x3443;
const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: egl::Int = 0x3444;
const EGL_OPENGL_ES3_BIT: egl::Int = 0x0040;

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

type CreateImageKhrFn = unsafe extern "C" fn(
    egl::EGLDisplay,
    egl::EGLContext,
    egl::Enum,
    egl::EGLClientBuffer,
    *const egl::Int,
) -> *mut c_void;
type DestroyImageKhrFn = unsafe extern "C" fn(egl::EGLDisplay, *mut c_void) -> egl::Boolean;
type ImageTargetTexture2dOesFn = unsafe extern "C" fn(target: u32, image: *mut c_void);

pub struct EglContext {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    create_image_khr: CreateImageKhrFn,
    destroy_image_khr: DestroyImageKhrFn,
    image_target_texture_2d_oes: ImageTargetTexture2dOesFn,
}

/// Opaque handle over an `EGLImageKHR`; owns nothing but its own lifetime —
/// the caller is still responsible for the dma-buf fds it was built from.
/// The renderer closes them once the image has been created.
pub struct EglImage(*mut c_void);

impl EglContext {
    /// Creates a headless (pbuffer) GLES3 context sized to the output.
    /// Shader programs are compiled by the caller immediately afterwards;
    /// this whole sequence is fatal-on-failure at startup.
    pub fn new(width: i32, height: i32) -> CoreResult<(Self, glow::Context)> {
        let egl = EglInstance::load_required()
            .map_err(|e| CoreError::RenderFailure(format!("failed to load libEGL: {e}")))?;

        let display = egl
            .get_display(egl::DEFAULT_DISPLAY)
            .ok_or_else(|| CoreError::RenderFailure("eglGetDisplay returned no display".into()))?;

        let (major, minor) = egl
            .initialize(display)
            .map_err(|e| CoreError::RenderFailure(format!("eglInitialize: {e}")))?;
        tracing::info!(major, minor, "initialized EGL");

        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|e| CoreError::RenderFailure(format!("eglBindAPI: {e}")))?;

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::PBUFFER_BIT,
            egl::RENDERABLE_TYPE,
            EGL_OPENGL_ES3_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|e| CoreError::RenderFailure(format!("eglChooseConfig: {e}")))?
            .ok_or_else(|| CoreError::RenderFailure("no suitable EGL config".into()))?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attribs)
            .map_err(|e| CoreError::RenderFailure(format!("eglCreateContext: {e}")))?;

        let pbuffer_attribs = [egl::WIDTH, width, egl::HEIGHT, height, egl::NONE];
        let surface = egl
            .create_pbuffer_surface(display, config, &pbuffer_attribs)
            .map_err(|e| CoreError::RenderFailure(format!("eglCreatePbufferSurface: {e}")))?;

        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|e| CoreError::RenderFailure(format!("eglMakeCurrent: {e}")))?;

        let create_image_khr = load_proc::<CreateImageKhrFn>(&egl, "eglCreateImageKHR")?;
        let destroy_image_khr = load_proc::<DestroyImageKhrFn>(&egl, "eglDestroyImageKHR")?;
        let image_target_texture_2d_oes =
            load_proc::<ImageTargetTexture2dOesFn>(&egl, "glEGLImageTargetTexture2DOES")?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                CString::new(name)
                    .ok()
                    .and_then(|cname| egl.get_proc_address(cname.to_str().unwrap()))
                    .map(|f| f as *const c_void)
                    .unwrap_or(std::ptr::null())
            })
        };

        Ok((
            Self {
                egl,
                display,
                context,
                surface,
                create_image_khr,
                destroy_image_khr,
                image_target_texture_2d_oes,
            },
            gl,
        ))
    }

    /// Builds an `EGLImageKHR` over a dma-buf's planes. The fds are borrowed
    /// for the duration of this call only (EGL dup()s internally); the
    /// caller closes them immediately after, matching §5's "DMA-BUF fds are
    /// owned by the backend until delivered to the renderer, which closes
    /// them after image creation."
    pub fn import_dmabuf_image(
        &self,
        width: u32,
        height: u32,
        fourcc: u32,
        planes: &[DmabufPlane],
    ) -> CoreResult<EglImage> {
        let plane = planes
            .first()
            .ok_or_else(|| CoreError::RenderFailure("dma-buf frame with no planes".into()))?;

        let modifier = plane.modifier;
        let attribs: [egl::Int; 17] = [
            egl::WIDTH,
            width as egl::Int,
            egl::HEIGHT,
            height as egl::Int,
            EGL_LINUX_DRM_FOURCC_EXT,
            fourcc as egl::Int,
            EGL_DMA_BUF_PLANE0_FD_EXT,
            plane.fd.as_raw_fd(),
            EGL_DMA_BUF_PLANE0_OFFSET_EXT,
            plane.offset as egl::Int,
            EGL_DMA_BUF_PLANE0_PITCH_EXT,
            plane.pitch as egl::Int,
            EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
            (modifier & 0xFFFF_FFFF) as egl::Int,
            EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
            (modifier >> 32) as egl::Int,
            egl::NONE,
        ];

        let image = unsafe {
            (self.create_image_khr)(
                self.display.as_ptr(),
                egl::NO_CONTEXT,
                EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null_mut(),
                attribs.as_ptr(),
            )
        };

        if image.is_null() {
            return Err(CoreError::RenderFailure(
                "eglCreateImageKHR(EGL_LINUX_DMA_BUF_EXT) failed".into(),
            ));
        }

        Ok(EglImage(image))
    }

    /// Binds `image` to the currently-bound `GL_TEXTURE_EXTERNAL_OES`
    /// texture unit.
    pub fn bind_image_to_external_texture(&self, image: &EglImage) {
        unsafe {
            (self.image_target_texture_2d_oes)(TEXTURE_EXTERNAL_OES, image.0);
        }
    }

    pub fn destroy_image(&self, image: EglImage) {
        unsafe {
            (self.destroy_image_khr)(self.display.as_ptr(), image.0);
        }
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
    }
}

fn load_proc<F>(egl: &EglInstance, name: &str) -> CoreResult<F> {
    let cname = CString::new(name).unwrap();
    let ptr = egl
        .get_proc_address(cname.to_str().unwrap())
        .ok_or_else(|| CoreError::RenderFailure(format!("missing EGL extension entry point {name}")))?;
    // SAFETY: caller guarantees `F` matches the extension's documented
    // signature; this mirrors how every EGL extension loader in the wild
    // resolves function pointers, there being no typed alternative.
    Ok(unsafe { std::mem::transmute_copy(&ptr) })
}
