//! Compression formats used by partition images.
//!
//! The format is always inferred from file name components, never from
//! content: `sda1.ext4-ptcl-img.gz.aa` is gzip because one of its
//! dot-separated components is `gz`.
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zstd,
    Xz,
}

impl Compression {
    /// Detects compression from a single file name.
    ///
    /// zstd wins over gzip, which wins over xz, when a name carries several
    /// markers.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let components: Vec<&str> = name.split('.').skip(1).collect();
        let has = |ext: &str| components.iter().any(|c| c.eq_ignore_ascii_case(ext));
        if has("zst") || has("zstd") {
            Some(Compression::Zstd)
        } else if has("gz") || has("gzip") {
            Some(Compression::Gzip)
        } else if has("xz") {
            Some(Compression::Xz)
        } else {
            None
        }
    }

    /// Detects compression across a set of volume files.
    pub fn detect<P: AsRef<Path>>(files: &[P]) -> Option<Self> {
        let found: Vec<Compression> = files
            .iter()
            .filter_map(|f| f.as_ref().file_name()?.to_str())
            .filter_map(Compression::from_file_name)
            .collect();
        [Compression::Zstd, Compression::Gzip, Compression::Xz]
            .into_iter()
            .find(|c| found.contains(c))
    }

    /// The suffix appended to backup file names.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Zstd => "zst",
            Compression::Xz => "xz",
        }
    }

    /// Candidate programs, fastest first.
    pub fn programs(self) -> &'static [&'static str] {
        match self {
            Compression::Gzip => &["pigz", "gzip"],
            Compression::Zstd => &["pzstd", "zstd"],
            Compression::Xz => &["xz"],
        }
    }

    /// Arguments that make [`Compression::programs`] decompress stdin to stdout.
    pub fn decompress_args(self) -> &'static [&'static str] {
        &["-dc"]
    }

    /// Arguments that make [`Compression::programs`] compress stdin to stdout.
    pub fn compress_args(self) -> &'static [&'static str] {
        &["-c"]
    }

    /// Wraps `reader` in an in-process decoder for this format.
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> io::Result<Box<dyn Read + 'a>> {
        let reader = BufReader::new(reader);
        Ok(match self {
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Zstd => Box::new(ZstdDecoder::with_buffer(reader)?),
            Compression::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Xz => "xz",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gz" | "gzip" => Ok(Compression::Gzip),
            "zst" | "zstd" => Ok(Compression::Zstd),
            "xz" => Ok(Compression::Xz),
            other => Err(format!("unknown compression '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn detects_from_name_components() {
        assert_eq!(
            Compression::from_file_name("sda1.ext4-ptcl-img.gz.aa"),
            Some(Compression::Gzip)
        );
        assert_eq!(
            Compression::from_file_name("sda1.ext4-ptcl-img.zst"),
            Some(Compression::Zstd)
        );
        assert_eq!(Compression::from_file_name("sda2.dd-img.ab"), None);
        assert_eq!(Compression::from_file_name("gz"), None);
    }

    #[test]
    fn zstd_takes_precedence_across_volumes() {
        let files = ["a.ext4-ptcl-img.gz.aa", "a.ext4-ptcl-img.zst.ab"];
        assert_eq!(Compression::detect(&files), Some(Compression::Zstd));
        let plain: [&str; 0] = [];
        assert_eq!(Compression::detect(&plain), None);
    }

    #[test]
    fn gzip_decoder_reads_concatenated_members() {
        let mut data = Vec::new();
        for chunk in [&b"hello "[..], &b"world"[..]] {
            let mut enc = GzEncoder::new(Vec::new(), Level::default());
            enc.write_all(chunk).unwrap();
            data.extend(enc.finish().unwrap());
        }
        let mut out = String::new();
        Compression::Gzip
            .decoder(&data[..])
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn parses_names() {
        assert_eq!("ZSTD".parse::<Compression>(), Ok(Compression::Zstd));
        assert!("lz4".parse::<Compression>().is_err());
    }
}
