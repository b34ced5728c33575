//! Writers for the supported persistence formats.
//!
//! The pipeline itself never touches the filesystem; these helpers let a
//! driver persist the final mesh as Medit `.mesh` text, binary MSH 2.2
//! with the per-tet minimum dihedral angle attached, or the boundary
//! surface as a Wavefront `.obj` companion. Readers are intentionally
//! absent: the caller delivers triangle soups in memory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::Point3;

use crate::error::{TetError, TetResult};

fn wrap<T>(path: &Path, r: std::io::Result<T>) -> TetResult<T> {
    r.map_err(|source| TetError::IoWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a Medit `.mesh` file (MeshVersionFormatted 1, 1-based indices,
/// trailing reference tag of 0 on every entity).
pub fn save_mesh_medit(
    path: impl AsRef<Path>,
    vertices: &[Point3<f64>],
    tets: &[[u32; 4]],
) -> TetResult<()> {
    let path = path.as_ref();
    let file = wrap(path, File::create(path))?;
    let mut w = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        writeln!(w, "MeshVersionFormatted 1")?;
        writeln!(w, "Dimension 3")?;
        writeln!(w, "Vertices")?;
        writeln!(w, "{}", vertices.len())?;
        for p in vertices {
            writeln!(w, "{} {} {} 0", p.x, p.y, p.z)?;
        }
        writeln!(w, "Tetrahedra")?;
        writeln!(w, "{}", tets.len())?;
        for t in tets {
            writeln!(w, "{} {} {} {} 0", t[0] + 1, t[1] + 1, t[2] + 1, t[3] + 1)?;
        }
        writeln!(w, "End")?;
        w.flush()
    };
    wrap(path, write())
}

/// Write a binary MSH 2.2 file with `min_dihedral_angle` as a per-element
/// scalar field.
pub fn save_msh(
    path: impl AsRef<Path>,
    vertices: &[Point3<f64>],
    tets: &[[u32; 4]],
    min_dihedral_angles: &[f64],
) -> TetResult<()> {
    debug_assert_eq!(tets.len(), min_dihedral_angles.len());
    let path = path.as_ref();
    let file = wrap(path, File::create(path))?;
    let mut w = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        w.write_all(b"$MeshFormat\n2.2 1 8\n")?;
        // Endianness probe.
        w.write_all(&1i32.to_le_bytes())?;
        w.write_all(b"\n$EndMeshFormat\n")?;

        w.write_all(b"$Nodes\n")?;
        w.write_all(format!("{}\n", vertices.len()).as_bytes())?;
        for (i, p) in vertices.iter().enumerate() {
            w.write_all(&(i as i32 + 1).to_le_bytes())?;
            w.write_all(&p.x.to_le_bytes())?;
            w.write_all(&p.y.to_le_bytes())?;
            w.write_all(&p.z.to_le_bytes())?;
        }
        w.write_all(b"\n$EndNodes\n")?;

        w.write_all(b"$Elements\n")?;
        w.write_all(format!("{}\n", tets.len()).as_bytes())?;
        // One block: element type 4 (tetrahedron), zero tags.
        w.write_all(&4i32.to_le_bytes())?;
        w.write_all(&(tets.len() as i32).to_le_bytes())?;
        w.write_all(&0i32.to_le_bytes())?;
        for (i, t) in tets.iter().enumerate() {
            w.write_all(&(i as i32 + 1).to_le_bytes())?;
            for &v in t {
                w.write_all(&(v as i32 + 1).to_le_bytes())?;
            }
        }
        w.write_all(b"\n$EndElements\n")?;

        w.write_all(b"$ElementData\n")?;
        w.write_all(b"1\n\"min_dihedral_angle\"\n")?;
        w.write_all(b"1\n0\n")?;
        w.write_all(format!("3\n0\n1\n{}\n", tets.len()).as_bytes())?;
        for (i, &angle) in min_dihedral_angles.iter().enumerate() {
            w.write_all(&(i as i32 + 1).to_le_bytes())?;
            w.write_all(&angle.to_le_bytes())?;
        }
        w.write_all(b"\n$EndElementData\n")?;
        w.flush()
    };
    wrap(path, write())
}

/// Write a triangle surface as Wavefront OBJ.
pub fn save_obj_surface(
    path: impl AsRef<Path>,
    vertices: &[Point3<f64>],
    faces: &[[u32; 3]],
) -> TetResult<()> {
    let path = path.as_ref();
    let file = wrap(path, File::create(path))?;
    let mut w = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        for p in vertices {
            writeln!(w, "v {} {} {}", p.x, p.y, p.z)?;
        }
        for f in faces {
            writeln!(w, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1)?;
        }
        w.flush()
    };
    wrap(path, write())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<Point3<f64>>, Vec<[u32; 4]>, Vec<f64>) {
        (
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 1, 2, 3]],
            vec![0.95],
        )
    }

    #[test]
    fn medit_output_is_one_based_with_tags() {
        let (v, t, _) = sample();
        let file = tempfile::NamedTempFile::new().unwrap();
        save_mesh_medit(file.path(), &v, &t).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.starts_with("MeshVersionFormatted 1"));
        assert!(text.contains("Dimension 3"));
        assert!(text.contains("Vertices\n4"));
        assert!(text.contains("Tetrahedra\n1"));
        assert!(text.contains("1 2 3 4 0"));
        assert!(text.trim_end().ends_with("End"));
    }

    #[test]
    fn msh_header_and_sections_present() {
        let (v, t, a) = sample();
        let file = tempfile::NamedTempFile::new().unwrap();
        save_msh(file.path(), &v, &t, &a).unwrap();
        let bytes = std::fs::read(file.path()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("$MeshFormat\n2.2 1 8\n"));
        for section in [
            "$EndMeshFormat",
            "$Nodes",
            "$Elements",
            "$ElementData",
            "min_dihedral_angle",
            "$EndElementData",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
        // Endianness probe right after the header line.
        let probe_at = b"$MeshFormat\n2.2 1 8\n".len();
        assert_eq!(&bytes[probe_at..probe_at + 4], &1i32.to_le_bytes());
    }

    #[test]
    fn obj_surface_roundtrips_textually() {
        let (v, _, _) = sample();
        let file = tempfile::NamedTempFile::new().unwrap();
        save_obj_surface(file.path(), &v, &[[0, 1, 2]]).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("v 0 0 0"));
        assert!(text.contains("f 1 2 3"));
    }

    #[test]
    fn write_failure_maps_to_io_error() {
        let (v, t, _) = sample();
        let err = save_mesh_medit("/nonexistent-dir/out.mesh", &v, &t).unwrap_err();
        assert!(matches!(err, TetError::IoWrite { .. }));
    }
}
