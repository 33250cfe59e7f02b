//! GLSL ES shader sources compiled at renderer init. Failure to compile any
//! of these, including the damage program, is fatal at startup — there is
//! no degraded rendering mode to fall back to.

use glow::HasContext;

use crate::error::{CoreError, CoreResult};

pub const VERTEX_SHADER: &str = r#"#version 300 es
precision highp float;
layout(location = 0) in vec2 a_pos;
out vec2 v_uv;
void main() {
    v_uv = a_pos * 0.5 + 0.5;
    gl_Position = vec4(a_pos, 0.0, 1.0);
}
"#;

/// Samples an ordinary 2D texture. Y is flipped to compensate for the
/// screencopy/framebuffer source being top-down while GL textures are
/// bottom-up, toggled by the caller via `u_flip_y` to match whatever the
/// compositor's `flags` event actually reports for this frame.
pub const PLAIN_FRAGMENT_SHADER: &str = r#"#version 300 es
precision highp float;
in vec2 v_uv;
out vec4 o_color;
uniform sampler2D u_tex;
uniform bool u_flip_y;
void main() {
    vec2 uv = u_flip_y ? vec2(v_uv.x, 1.0 - v_uv.y) : v_uv;
    o_color = texture(u_tex, uv);
}
"#;

/// Samples an external-OES texture imported from a dma-buf, flipping the
/// texture coordinate's Y to match the orientation export-dmabuf frames
/// are delivered in.
pub const DMABUF_FRAGMENT_SHADER: &str = r#"#version 300 es
#extension GL_OES_EGL_image_external_essl3 : require
precision highp float;
in vec2 v_uv;
out vec4 o_color;
uniform samplerExternalOES u_tex;
void main() {
    vec2 uv = vec2(v_uv.x, 1.0 - v_uv.y);
    o_color = texture(u_tex, uv);
}
"#;

/// Samples two same-size textures at matching coordinates and writes a
/// non-zero result iff they differ, the core of the tile-damage pass.
pub const DAMAGE_FRAGMENT_SHADER: &str = r#"#version 300 es
precision highp float;
in vec2 v_uv;
out vec4 o_color;
uniform sampler2D u_current;
uniform sampler2D u_previous;
void main() {
    vec4 a = texture(u_current, v_uv);
    vec4 b = texture(u_previous, v_uv);
    float changed = step(0.0001, distance(a, b));
    o_color = vec4(changed, changed, changed, 1.0);
}
"#;

pub fn compile_program(gl: &glow::Context, vertex_src: &str, fragment_src: &str) -> CoreResult<glow::Program> {
    unsafe {
        let program = gl
            .create_program()
            .map_err(|e| CoreError::RenderFailure(format!("create_program: {e}")))?;

        let vertex = compile_shader(gl, glow::VERTEX_SHADER, vertex_src)?;
        let fragment = compile_shader(gl, glow::FRAGMENT_SHADER, fragment_src)?;

        gl.attach_shader(program, vertex);
        gl.attach_shader(program, fragment);
        gl.link_program(program);

        let linked = gl.get_program_link_status(program);
        let log = gl.get_program_info_log(program);

        gl.detach_shader(program, vertex);
        gl.detach_shader(program, fragment);
        gl.delete_shader(vertex);
        gl.delete_shader(fragment);

        if !linked {
            gl.delete_program(program);
            return Err(CoreError::RenderFailure(format!("link_program failed: {log}")));
        }

        Ok(program)
    }
}

unsafe fn compile_shader(gl: &glow::Context, kind: u32, src: &str) -> CoreResult<glow::Shader> {
    let shader = gl
        .create_shader(kind)
        .map_err(|e| CoreError::RenderFailure(format!("create_shader: {e}")))?;
    gl.shader_source(shader, src);
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(CoreError::RenderFailure(format!("shader compile failed: {log}")));
    }
    Ok(shader)
}
