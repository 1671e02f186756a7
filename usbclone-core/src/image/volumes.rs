//! Locates and orders the files holding one partition's image data.
//!
//! A partition image is stored under one of two naming families, each
//! optionally preceded by an arbitrary `<prefix>-`, optionally compressed,
//! and optionally split into volumes with two-letter suffixes:
//!
//! - partclone: `sda1.ext4-ptcl-img.gz.aa`
//! - dd: `sda2.dd-img`, `sda2.raw-dd-img.zst.ab`, or the legacy `sda2.raw.img`
use regex::Regex;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The two image families a partition can be stored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFamily {
    Partclone,
    Dd,
}

/// The split-volume suffix of a file name (`aa`..`zz`), if it has one.
pub fn volume_suffix(name: &str) -> Option<&str> {
    let (_, suffix) = name.rsplit_once('.')?;
    (suffix.len() == 2 && suffix.bytes().all(|b| b.is_ascii_lowercase())).then_some(suffix)
}

/// Position of a two-letter suffix in base 26 (`aa` is 0, `ab` is 1), or
/// -1 when there is no valid suffix.
pub fn volume_suffix_index(suffix: Option<&str>) -> i32 {
    match suffix.map(str::as_bytes) {
        Some([a, b]) if a.is_ascii_lowercase() && b.is_ascii_lowercase() => {
            i32::from(a - b'a') * 26 + i32::from(b - b'a')
        }
        _ => -1,
    }
}

fn sort_key(path: &Path) -> (String, i32, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = volume_suffix(&name);
    let stem = match suffix {
        Some(s) => name[..name.len() - s.len() - 1].to_string(),
        None => name.clone(),
    };
    (stem, volume_suffix_index(suffix), name)
}

/// Orders volumes by `(stem, suffix index, name)` and drops duplicates.
///
/// An unsuffixed file sorts before its suffixed siblings.
pub fn sorted_volumes<I>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut keyed: Vec<_> = paths.into_iter().map(|p| (sort_key(&p), p)).collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.dedup_by(|(_, a), (_, b)| a == b);
    keyed.into_iter().map(|(_, p)| p).collect()
}

/// The filesystem type recorded in a partclone image name.
///
/// `sda1.ext4-ptcl-img.gz.aa` yields `ext4`.
pub fn extract_partclone_fstype(part: &str, file_name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"{}\.(.+?)-ptcl-img", regex::escape(part))).ok()?;
    re.captures(file_name).map(|c| c[1].to_string())
}

struct FamilyPatterns {
    direct: Regex,
    prefixed: Regex,
}

fn patterns(part: &str, body: &str) -> Option<FamilyPatterns> {
    let part = regex::escape(part);
    Some(FamilyPatterns {
        direct: Regex::new(&format!(r"^{part}\.{body}$")).ok()?,
        prefixed: Regex::new(&format!(r"^.+-{part}\.{body}$")).ok()?,
    })
}

fn list_files(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(files)
}

/// Picks between the direct-name and prefixed sets: the prefixed set wins
/// only if it holds strictly more volumes.
fn choose_set(direct: Vec<PathBuf>, prefixed: Vec<PathBuf>) -> Vec<PathBuf> {
    match prefixed.len().cmp(&direct.len()) {
        Ordering::Greater => prefixed,
        _ if direct.is_empty() => prefixed,
        _ => direct,
    }
}

fn match_family(files: &[(String, PathBuf)], pats: &FamilyPatterns) -> Vec<PathBuf> {
    let pick = |re: &Regex| {
        files
            .iter()
            .filter(|(name, _)| re.is_match(name))
            .map(|(_, p)| p.clone())
            .collect::<Vec<_>>()
    };
    sorted_volumes(choose_set(pick(&pats.direct), pick(&pats.prefixed)))
}

/// Finds the ordered volumes of `part` in `dir` for one image family.
///
/// For [`ImageFamily::Dd`], `*-dd-img` files take precedence over the
/// legacy `*.img` naming.
pub fn find_volumes(dir: &Path, part: &str, family: ImageFamily) -> io::Result<Vec<PathBuf>> {
    let files = list_files(dir)?;
    Ok(find_in(&files, part, family))
}

fn find_in(files: &[(String, PathBuf)], part: &str, family: ImageFamily) -> Vec<PathBuf> {
    let bodies: &[&str] = match family {
        ImageFamily::Partclone => &[r"[^/]+?-ptcl-img(?:\..+)?"],
        ImageFamily::Dd => &[r"(?:[^.]*-)?dd-img(?:\..+)?", r"[^.]+(?:\.[^.]+)*?\.img(?:\..+)?"],
    };
    for body in bodies {
        let Some(pats) = patterns(part, body) else {
            continue;
        };
        let found = match_family(files, &pats);
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// Whether `dir` holds files that look like image data for `part` but fit
/// neither naming family. Such files point at a foreign or damaged image
/// rather than at a partition that was never saved.
pub fn has_unrecognized_image_files(dir: &Path, part: &str) -> io::Result<bool> {
    let direct = format!("{part}.");
    let prefixed = format!("-{part}.");
    Ok(list_files(dir)?
        .iter()
        .any(|(name, _)| (name.starts_with(&direct) || name.contains(&prefixed)) && name.contains("img")))
}
