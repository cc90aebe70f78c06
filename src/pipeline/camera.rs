//! Column-major camera matrices for passes that bypass the kernel compiler.

use crate::backend::ClipPoint;
use crate::error::RenderError;
use crate::graph::component::Component;

const EPSILON: f32 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraParams {
    pub eye: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    /// Vertical field of view in degrees.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            eye: [0.0, 0.0, -5.0],
            target: [0.0, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fov_y: 60.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl CameraParams {
    /// Eye, look-at point and field of view from a Camera3D's fields; missing
    /// fields keep their defaults.
    pub fn from_component(camera: &Component) -> Self {
        let d = Self::default();
        let f = |name: &str, default: f32| camera.field(name).unwrap_or(default);
        Self {
            eye: [f("_posX", d.eye[0]), f("_posY", d.eye[1]), f("_posZ", d.eye[2])],
            target: [
                f("_lookAtX", d.target[0]),
                f("_lookAtY", d.target[1]),
                f("_lookAtZ", d.target[2]),
            ],
            fov_y: f("_fov", d.fov_y),
            ..d
        }
    }

    pub fn view_projection(&self, aspect: f32) -> Result<[f32; 16], RenderError> {
        if !(self.fov_y > 0.0 && self.fov_y < 180.0) {
            return Err(RenderError::DegenerateCamera(format!(
                "field of view must be within (0, 180) degrees, got {}",
                self.fov_y
            )));
        }
        if !(aspect > 0.0 && aspect.is_finite()) {
            return Err(RenderError::DegenerateCamera(format!("aspect {aspect}")));
        }
        if !(self.near > 0.0 && self.far > self.near) {
            return Err(RenderError::DegenerateCamera(format!(
                "near {} / far {}",
                self.near, self.far
            )));
        }
        let view = look_at(self.eye, self.target, self.up)?;
        let projection = perspective_rh_zo(self.fov_y.to_radians(), aspect, self.near, self.far);
        Ok(mat4_mul(projection, view))
    }
}

pub fn mat4_mul(a: [f32; 16], b: [f32; 16]) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = a[row] * b[col * 4]
                + a[4 + row] * b[col * 4 + 1]
                + a[8 + row] * b[col * 4 + 2]
                + a[12 + row] * b[col * 4 + 3];
        }
    }
    out
}

pub fn perspective_rh_zo(fovy_radians: f32, aspect: f32, near: f32, far: f32) -> [f32; 16] {
    let f = 1.0 / (0.5 * fovy_radians).tan();
    let z_scale = far / (near - far);
    let z_translate = (far * near) / (near - far);
    [
        f / aspect, 0.0, 0.0, 0.0, //
        0.0, f, 0.0, 0.0, //
        0.0, 0.0, z_scale, -1.0, //
        0.0, 0.0, z_translate, 0.0,
    ]
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f32; 3], what: &str) -> Result<[f32; 3], RenderError> {
    let len = dot(v, v).sqrt();
    if !(len > EPSILON) {
        return Err(RenderError::DegenerateCamera(format!("{what} vector has no length")));
    }
    Ok([v[0] / len, v[1] / len, v[2] / len])
}

pub fn look_at(eye: [f32; 3], target: [f32; 3], up: [f32; 3]) -> Result<[f32; 16], RenderError> {
    let forward = normalize(sub(target, eye), "direction")?;
    let up = normalize(up, "up")?;
    let right = normalize(cross(forward, up), "right")?;
    let true_up = cross(right, forward);
    Ok([
        right[0],
        true_up[0],
        -forward[0],
        0.0,
        right[1],
        true_up[1],
        -forward[1],
        0.0,
        right[2],
        true_up[2],
        -forward[2],
        0.0,
        -dot(right, eye),
        -dot(true_up, eye),
        dot(forward, eye),
        1.0,
    ])
}

pub fn transform_point(m: &[f32; 16], p: [f32; 3]) -> ClipPoint {
    let mut out = [0.0; 4];
    for (row, v) in out.iter_mut().enumerate() {
        *v = m[row] * p[0] + m[4 + row] * p[1] + m[8 + row] * p[2] + m[12 + row];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::project_to_pixel;
    use crate::graph::library::pinhole_camera_3d;

    #[test]
    fn target_projects_to_the_center() {
        let cam = CameraParams::default();
        let m = cam.view_projection(1.0).unwrap();
        let clip = transform_point(&m, cam.target);
        assert!(clip[3] > 0.0);
        assert!((clip[0] / clip[3]).abs() < 1e-5);
        assert!((clip[1] / clip[3]).abs() < 1e-5);
        assert_eq!(project_to_pixel(clip, 10, 10), Some((5, 5)));
    }

    #[test]
    fn points_behind_the_eye_are_culled() {
        let cam = CameraParams::default();
        let m = cam.view_projection(1.0).unwrap();
        assert_eq!(project_to_pixel(transform_point(&m, [0.0, 0.0, -10.0]), 10, 10), None);
    }

    #[test]
    fn up_is_up_on_screen() {
        let m = CameraParams::default().view_projection(1.0).unwrap();
        let (_, y) = project_to_pixel(transform_point(&m, [0.0, 1.0, 0.0]), 100, 100).unwrap();
        assert!(y < 50);
    }

    #[test]
    fn degenerate_cameras_are_errors() {
        let cam = CameraParams {
            target: [0.0, 0.0, -5.0],
            ..CameraParams::default()
        };
        assert!(cam.view_projection(1.0).is_err());
        let cam = CameraParams {
            fov_y: 0.0,
            ..CameraParams::default()
        };
        assert!(cam.view_projection(1.0).is_err());
    }

    #[test]
    fn component_fields_drive_the_camera() {
        let c = pinhole_camera_3d("cam").with_field("_fov", 45.0).with_field("_posY", 2.0);
        let params = CameraParams::from_component(&c);
        assert_eq!(params.fov_y, 45.0);
        assert_eq!(params.eye, [0.0, 2.0, -5.0]);
    }
}
