use crate::Compression;

impl Compression {
    fn magic(self) -> &'static [u8] {
        match self {
            Compression::Gzip => &[0x1F, 0x8B],
            Compression::Bzip2 => b"BZh",
            Compression::Xz => &[0xFD, b'7', b'z', b'X', b'Z', 0x00],
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Bzip2 => "bz2",
            Compression::Xz => "xz",
        }
    }

    /// The format a file name's extension announces. A leading dot doesn't
    /// start an extension, so `.gz` on its own is nothing.
    pub fn from_name(name: &str) -> Option<Self> {
        let (stem, extension) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|c| c.extension().eq_ignore_ascii_case(extension))
    }

    /// The format of a MIME type, ignoring parameters.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        Self::ALL
            .into_iter()
            .find(|c| c.mime_types().iter().any(|m| m.eq_ignore_ascii_case(essence)))
    }

    /// The format whose magic bytes `head` starts with.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| head.starts_with(c.magic()))
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[rstest]
    #[case("file.txt", None)]
    #[case(".bz2", None)]
    #[case("report.csv.bz2", Some(Compression::Bzip2))]
    #[case("report.csv.gz", Some(Compression::Gzip))]
    #[case("dump.sql.XZ", Some(Compression::Xz))]
    fn test_from_name(#[case] name: &str, #[case] expected: Option<Compression>) {
        assert_eq!(Compression::from_name(name), expected);
    }

    #[rstest]
    #[case("application/gzip", Some(Compression::Gzip))]
    #[case("application/x-gzip; charset=binary", Some(Compression::Gzip))]
    #[case("application/x-bzip2", Some(Compression::Bzip2))]
    #[case("application/XZ", Some(Compression::Xz))]
    #[case("application/x-tar", None)]
    fn test_from_mime(#[case] mime: &str, #[case] expected: Option<Compression>) {
        assert_eq!(Compression::from_mime(mime), expected);
    }

    #[rstest]
    #[case(b"plain text", None)]
    #[case(&[], None)]
    #[case(b"BZh91AY", Some(Compression::Bzip2))]
    #[case(&[0x1F, 0x8B, 0x08, 0x00], Some(Compression::Gzip))]
    #[case(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00], Some(Compression::Xz))]
    fn test_sniff(#[case] head: &[u8], #[case] expected: Option<Compression>) {
        assert_eq!(Compression::sniff(head), expected);
    }
}
