//! The single-stream compression formats that a scan looks straight through.
//!
//! A gzip, bzip2 or xz file is exposed to the scanner as a source with one
//! object in it: the decompressed content. This crate knows how to recognise
//! each format (by name, by MIME type or by magic bytes) and how to decode
//! it, either in memory or as a `Send` reader that a blocking task can drain.
//! The transport also uses gzip for message bodies.

mod codec;
mod detect;
pub mod error;

pub use crate::codec::BoxRead;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Compression {
    #[display("gzip")]
    Gzip,
    #[display("bzip2")]
    Bzip2,
    #[display("xz")]
    Xz,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::Gzip, Compression::Bzip2, Compression::Xz];

    /// The name used in `content-encoding` headers and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }

    /// Every MIME type this format goes by, the canonical one first.
    pub fn mime_types(self) -> &'static [&'static str] {
        match self {
            Compression::Gzip => &["application/gzip", "application/x-gzip"],
            Compression::Bzip2 => &["application/x-bzip2", "application/bzip2"],
            Compression::Xz => &["application/x-xz", "application/xz"],
        }
    }

    pub fn mime_type(self) -> &'static str {
        self.mime_types()[0]
    }

    /// Type label of the source that holds the decompressed content.
    pub fn source_type_label(self) -> &'static str {
        match self {
            Compression::Gzip => "filtered-gzip",
            Compression::Bzip2 => "filtered-bz2",
            Compression::Xz => "filtered-lzma",
        }
    }

    pub fn from_source_type_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.source_type_label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Compression::Gzip, "filtered-gzip")]
    #[case(Compression::Bzip2, "filtered-bz2")]
    #[case(Compression::Xz, "filtered-lzma")]
    fn test_source_type_labels(#[case] compression: Compression, #[case] label: &str) {
        assert_eq!(compression.source_type_label(), label);
        assert_eq!(Compression::from_source_type_label(label), Some(compression));
    }

    #[test]
    fn test_unknown_source_type_label() {
        assert_eq!(Compression::from_source_type_label("filtered-none"), None);
    }

    #[test]
    fn test_canonical_mime_type_comes_first() {
        for compression in Compression::ALL {
            assert_eq!(compression.mime_type(), compression.mime_types()[0]);
            assert_eq!(compression.to_string(), compression.as_str());
        }
    }
}
