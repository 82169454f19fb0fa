pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// DC term of the real spherical harmonics basis.
pub const SH_C0: f32 = 0.282_094_8;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn inv_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

/// Per-channel spherical-harmonics coefficient count for a degree.
#[inline]
pub fn sh_coeffs_for_degree(deg: u8) -> usize {
    match deg {
        0 => 0,
        1 => 3,
        _ => 8,
    }
}

/// Total f32 count per splat for a degree (three color channels).
#[inline]
pub fn sh_floats_for_degree(deg: u8) -> usize {
    sh_coeffs_for_degree(deg) * 3
}

#[inline]
pub(crate) const fn degree_for_coeffs(dim: usize) -> u8 {
    if dim < 3 {
        0
    } else if dim < 8 {
        1
    } else {
        2
    }
}

/// Restore a quaternion stored as xyzw to unit length. Degenerate inputs
/// collapse to the identity rotation.
#[inline]
pub(crate) fn normalize_quat(q: &mut [f32]) {
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if norm > f32::EPSILON {
        q[0] /= norm;
        q[1] /= norm;
        q[2] /= norm;
        q[3] /= norm;
    } else {
        q[0] = 0.0;
        q[1] = 0.0;
        q[2] = 0.0;
        q[3] = 1.0;
    }
}
