//! Pairwise distances over the network volume
//!
//! The volume is a box `[x, y, z]` in um with depth on the y axis. Toroidal
//! rules wrap the x and z axes around the box boundary; depth never wraps.

/// Separation along one axis, optionally wrapped around the axis extent
pub fn axis_dist(a: f64, b: f64, size: f64, wrap: bool) -> f64 {
    let d = (a - b).abs();
    if wrap {
        d.min(size - d)
    } else {
        d
    }
}

/// Euclidean distance between two points; x and z wrap when `toroidal`
pub fn dist_3d(p: [f64; 3], q: [f64; 3], size: [f64; 3], toroidal: bool) -> f64 {
    let dx = axis_dist(p[0], q[0], size[0], toroidal);
    let dy = axis_dist(p[1], q[1], size[1], false);
    let dz = axis_dist(p[2], q[2], size[2], toroidal);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Horizontal (x-z plane) distance, ignoring depth; wraps when `toroidal`
pub fn dist_2d(p: [f64; 3], q: [f64; 3], size: [f64; 3], toroidal: bool) -> f64 {
    let dx = axis_dist(p[0], q[0], size[0], toroidal);
    let dz = axis_dist(p[2], q[2], size[2], toroidal);
    (dx * dx + dz * dz).sqrt()
}
