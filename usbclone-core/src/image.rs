//! Clonezilla image directories and the repositories that hold them.
//!
//! An image directory holds a `parts` file listing the saved partitions,
//! the layout files described in [`crate::table`], and one or more data
//! files per partition (see [`volumes`]).
pub mod plan;
pub mod volumes;

use crate::device::Drive;
use crate::error::{Error, Result};
use crate::table::{LayoutKind, classify};
use std::fs;
use std::path::{Path, PathBuf};

/// Subdirectories of a mounted drive searched for images, before its root.
const REPOSITORY_DIRS: [&str; 2] = ["clonezilla", "images"];

/// Layout files that name the partition table, most specific first.
const TABLE_KINDS: [LayoutKind; 3] = [LayoutKind::PtSf, LayoutKind::PtSgdisk, LayoutKind::PtParted];

/// A saved disk image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonezillaImage {
    /// Directory name, shown to the operator.
    pub name: String,
    pub path: PathBuf,
    /// Partition names from the `parts` file, in order.
    pub parts: Vec<String>,
    pub partition_table: Option<PathBuf>,
}

impl ClonezillaImage {
    /// Reads the image's metadata without touching partition data.
    ///
    /// # Errors
    ///
    /// [`Error::ImageFormat`] when `dir` is not a directory or the `parts`
    /// file is missing or empty.
    pub fn load(dir: &Path) -> Result<Self> {
        let parts = read_parts(dir)?;
        Ok(ClonezillaImage {
            name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string()),
            path: dir.to_path_buf(),
            parts,
            partition_table: find_partition_table(dir),
        })
    }

    /// Total bytes of all files in the image directory.
    pub fn size_on_disk(&self) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.path)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

/// Parses the whitespace-separated `parts` file of an image.
pub fn read_parts(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(Error::ImageFormat(format!(
            "image folder not found: {}",
            dir.display()
        )));
    }
    let parts_path = dir.join("parts");
    if !parts_path.is_file() {
        return Err(Error::ImageFormat(format!(
            "parts file missing in {}",
            dir.display()
        )));
    }
    let parts: Vec<String> = fs::read_to_string(&parts_path)?
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(Error::ImageFormat(format!(
            "parts list empty in {}",
            dir.display()
        )));
    }
    Ok(parts)
}

fn file_names(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    names.sort();
    names
}

/// The partition-table file of an image, preferring sfdisk dumps.
pub fn find_partition_table(dir: &Path) -> Option<PathBuf> {
    let names = file_names(dir);
    TABLE_KINDS.iter().find_map(|&wanted| {
        names
            .iter()
            .find(|(name, _)| classify(name).is_some_and(|(kind, _)| kind == wanted))
            .map(|(_, path)| path.clone())
    })
}

/// Whether `dir` looks like an image: a `parts` file plus a partition table
/// or partition data.
pub fn is_image_dir(dir: &Path) -> bool {
    if !dir.join("parts").is_file() {
        return false;
    }
    find_partition_table(dir).is_some()
        || file_names(dir)
            .iter()
            .any(|(name, _)| name.contains("-ptcl-img") || name.contains("dd-img"))
}

/// Image directories directly under `repo`, sorted by name.
pub fn list_image_dirs(repo: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(repo) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir() && is_image_dir(p))
        .collect();
    dirs.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    dirs
}

/// Whether `path` is an `.iso` file, written to a device as is.
pub fn is_iso_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"))
}

/// `.iso` files directly under `repo`, sorted by name.
pub fn list_iso_files(repo: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(repo) else {
        return Vec::new();
    };
    let mut isos: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| is_iso_file(p))
        .collect();
    isos.sort();
    isos
}

/// Finds the image repository under `root`: `clonezilla/`, then
/// `images/`, then `root` itself, whichever first holds an image.
pub fn find_repository_in(root: &Path) -> Option<PathBuf> {
    REPOSITORY_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .chain(std::iter::once(root.to_path_buf()))
        .find(|candidate| candidate.is_dir() && !list_image_dirs(candidate).is_empty())
}

/// Finds the image repository on the first mounted filesystem of `drive`.
pub fn find_image_repository(drive: &Drive) -> Option<PathBuf> {
    drive
        .mountpoints()
        .into_iter()
        .find_map(find_repository_in)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Partition;

    fn make_image(dir: &Path, parts: &str, files: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("parts"), parts).unwrap();
        for name in files {
            fs::write(dir.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn loads_parts_and_table() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("2024-05-01-img");
        make_image(&dir, "sda1 sda2\n", &["sda-pt.parted", "sda-pt.sf", "sda1.ext4-ptcl-img.gz.aa"]);

        let image = ClonezillaImage::load(&dir).unwrap();
        assert_eq!(image.name, "2024-05-01-img");
        assert_eq!(image.parts, ["sda1", "sda2"]);
        assert_eq!(image.partition_table, Some(dir.join("sda-pt.sf")));
        assert_eq!(image.size_on_disk().unwrap(), "sda1 sda2\n".len() as u64 + 3);
    }

    #[test]
    fn missing_or_empty_parts_is_a_format_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ClonezillaImage::load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::ImageFormat(ref m) if m.contains("parts file missing")));

        fs::write(tmp.path().join("parts"), " \n").unwrap();
        let err = ClonezillaImage::load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::ImageFormat(ref m) if m.contains("empty")));

        let err = read_parts(&tmp.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn lists_only_image_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        make_image(&tmp.path().join("b-img"), "sda1", &["sda1.dd-img"]);
        make_image(&tmp.path().join("a-img"), "sda1", &["sda-pt.sf"]);
        make_image(&tmp.path().join("not-an-image"), "sda1", &["notes.txt"]);
        fs::create_dir(tmp.path().join("empty")).unwrap();

        let names: Vec<_> = list_image_dirs(tmp.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a-img", "b-img"]);
    }

    #[test]
    fn iso_files_are_listed_apart_from_images() {
        let tmp = tempfile::tempdir().unwrap();
        make_image(&tmp.path().join("a-img"), "sda1", &["sda-pt.sf"]);
        fs::write(tmp.path().join("debian.ISO"), b"iso").unwrap();
        fs::write(tmp.path().join("alpine.iso"), b"iso").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(tmp.path().join("folder.iso")).unwrap();

        assert_eq!(
            list_iso_files(tmp.path()),
            [tmp.path().join("alpine.iso"), tmp.path().join("debian.ISO")]
        );
        assert!(!is_iso_file(&tmp.path().join("a-img")));
        assert_eq!(list_image_dirs(tmp.path()).len(), 1);
    }

    #[test]
    fn repository_search_order() {
        let tmp = tempfile::tempdir().unwrap();
        make_image(&tmp.path().join("top-img"), "sda1", &["sda-pt.sf"]);
        assert_eq!(find_repository_in(tmp.path()), Some(tmp.path().to_path_buf()));

        make_image(&tmp.path().join("images/img"), "sda1", &["sda-pt.sf"]);
        assert_eq!(find_repository_in(tmp.path()), Some(tmp.path().join("images")));

        let drive = Drive {
            name: "sdb".into(),
            partitions: vec![Partition {
                name: "sdb1".into(),
                mountpoint: Some(tmp.path().to_path_buf()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(find_image_repository(&drive), Some(tmp.path().join("images")));
        assert_eq!(find_image_repository(&Drive::default()), None);
    }
}
