//! Gamma-centred automatic k-point meshes from a structure's lattice.

use crate::error::{Result, RunnerError};
use crate::fsutil::atomic_write_bytes;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

type Vec3 = [f64; 3];

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn parse_vector(line: &str) -> Option<Vec3> {
    let mut it = line.split_whitespace().map(|t| t.parse::<f64>());
    match (it.next(), it.next(), it.next()) {
        (Some(Ok(x)), Some(Ok(y)), Some(Ok(z))) => Some([x, y, z]),
        _ => None,
    }
}

/// Reads the scaled lattice vectors from the header of a structure file.
///
/// A negative scale factor is the target cell volume.
pub fn read_lattice(poscar: &str) -> Option<[Vec3; 3]> {
    let mut lines = poscar.lines().skip(1);
    let scale: f64 = lines.next()?.split_whitespace().next()?.parse().ok()?;
    let a = parse_vector(lines.next()?)?;
    let b = parse_vector(lines.next()?)?;
    let c = parse_vector(lines.next()?)?;
    let volume = dot(a, cross(b, c)).abs();
    let factor = if scale < 0.0 {
        if volume == 0.0 {
            return None;
        }
        (-scale / volume).cbrt()
    } else {
        scale
    };
    let s = |v: Vec3| [v[0] * factor, v[1] * factor, v[2] * factor];
    Some([s(a), s(b), s(c)])
}

/// Mesh divisions so the spacing along each reciprocal vector (2π
/// included) does not exceed `kspacing`.
pub fn mesh_for(lattice: &[Vec3; 3], kspacing: f64) -> Option<[u32; 3]> {
    let [a, b, c] = *lattice;
    let volume = dot(a, cross(b, c));
    if volume == 0.0 || !(kspacing > 0.0) {
        return None;
    }
    let reciprocal = [cross(b, c), cross(c, a), cross(a, b)];
    let mut mesh = [1u32; 3];
    for (k, g) in mesh.iter_mut().zip(reciprocal) {
        let length = 2.0 * PI * dot(g, g).sqrt() / volume.abs();
        *k = ((length / (2.0 * PI * kspacing)).ceil() as u32).max(1);
    }
    Some(mesh)
}

pub fn render(mesh: [u32; 3]) -> String {
    format!(
        "A\n0\nG\n{:2} {:2} {:2}\n{:2} {:2} {:2}\n",
        mesh[0], mesh[1], mesh[2], 0, 0, 0
    )
}

/// Writes `KPOINTS` into `step_dir` for the structure at `poscar`.
pub fn write_for_structure(poscar: &Path, step_dir: &Path, kspacing: f64) -> Result<[u32; 3]> {
    let text = fs::read_to_string(poscar)?;
    let lattice = read_lattice(&text).ok_or_else(|| RunnerError::State {
        path: poscar.to_path_buf(),
        message: "cannot read lattice vectors".to_string(),
    })?;
    let mesh = mesh_for(&lattice, kspacing).ok_or_else(|| RunnerError::State {
        path: poscar.to_path_buf(),
        message: "degenerate cell".to_string(),
    })?;
    atomic_write_bytes(&step_dir.join(crate::KPOINTS_FILE), render(mesh).as_bytes())?;
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUBIC: &str = "Si\n1.0\n5.0 0.0 0.0\n0.0 5.0 0.0\n0.0 0.0 10.0\nSi\n2\nDirect\n0 0 0\n0.5 0.5 0.5\n";

    #[test]
    fn orthorhombic_mesh_scales_with_inverse_length() {
        let lattice = read_lattice(CUBIC).expect("lattice");
        // |b| = 2π/5 and 2π/10; divisions = ceil(1/(5·0.03)) and ceil(1/(10·0.03)).
        assert_eq!(mesh_for(&lattice, 0.03), Some([7, 7, 4]));
        assert_eq!(mesh_for(&lattice, 10.0), Some([1, 1, 1]));
    }

    #[test]
    fn scale_factor_applies_to_lattice() {
        let scaled = CUBIC.replacen("1.0", "2.0", 1);
        let lattice = read_lattice(&scaled).expect("lattice");
        assert_eq!(lattice[0][0], 10.0);
        let volume_scaled = CUBIC.replacen("1.0", "-2000.0", 1);
        let lattice = read_lattice(&volume_scaled).expect("lattice");
        assert!((lattice[2][2] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(read_lattice("Si\n1.0\n5 0 0\n").is_none());
        assert!(read_lattice("Si\nx\n5 0 0\n0 5 0\n0 0 5\n").is_none());
    }

    #[test]
    fn writes_gamma_centred_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let poscar = dir.path().join("POSCAR");
        fs::write(&poscar, CUBIC).expect("poscar");
        let mesh = write_for_structure(&poscar, dir.path(), 0.03).expect("write");
        assert_eq!(mesh, [7, 7, 4]);
        let text = fs::read_to_string(dir.path().join("KPOINTS")).expect("read");
        assert_eq!(text, "A\n0\nG\n 7  7  4\n 0  0  0\n");
    }
}
