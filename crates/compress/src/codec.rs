use crate::Compression;
use crate::error::{ErrorKind, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use exn::ResultExt;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

/// A decompressing reader that can cross into a blocking task.
pub type BoxRead<'a> = Box<dyn Read + Send + 'a>;

impl Compression {
    /// Compresses in memory, favouring speed over ratio.
    pub fn compress(self, input: &[u8]) -> Result<Vec<u8>> {
        fn feed<W: Write>(mut encoder: W, input: &[u8]) -> std::io::Result<W> {
            encoder.write_all(input)?;
            Ok(encoder)
        }
        let output = Vec::with_capacity(input.len() / 2);
        let written = match self {
            Compression::Gzip => feed(GzEncoder::new(output, flate2::Compression::fast()), input).and_then(|e| e.finish()),
            Compression::Bzip2 => feed(BzEncoder::new(output, bzip2::Compression::fast()), input).and_then(|e| e.finish()),
            Compression::Xz => feed(XzEncoder::new(output, 1), input).and_then(|e| e.finish()),
        };
        written.or_raise(|| ErrorKind::Write(self))
    }

    /// Decompresses in memory.
    pub fn decompress(self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.reader(input).read_to_end(&mut output).or_raise(|| ErrorKind::Corrupt(self))?;
        Ok(output)
    }

    /// Wraps `compressed` in a reader of the decompressed content.
    pub fn reader<'a, R: Read + Send + 'a>(self, compressed: R) -> BoxRead<'a> {
        match self {
            Compression::Gzip => Box::new(GzDecoder::new(compressed)),
            Compression::Bzip2 => Box::new(BzDecoder::new(compressed)),
            Compression::Xz => Box::new(XzDecoder::new(compressed)),
        }
    }

    /// Decompresses all of `compressed` into `output`, returning the
    /// decompressed size.
    ///
    /// Read and write failures can't be told apart here, so both count as
    /// corrupt input.
    pub fn decompress_to<R: Read + Send, W: Write>(self, compressed: R, mut output: W) -> Result<u64> {
        let size = std::io::copy(&mut self.reader(compressed), &mut output).or_raise(|| ErrorKind::Corrupt(self))?;
        tracing::trace!(format = %self, size, "decompressed stream");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use crate::error::ErrorKind;
    use rstest::rstest;
    use std::io::{Cursor, Read};

    #[rstest]
    #[case(Compression::Gzip)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Xz)]
    fn test_reader_recovers_content(#[case] format: Compression) {
        let original = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit.".repeat(50);
        let compressed = format.compress(&original).unwrap();
        assert_eq!(Compression::sniff(&compressed), Some(format));

        let mut decompressed = Vec::new();
        format.reader(Cursor::new(compressed)).read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[rstest]
    #[case(Compression::Gzip)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Xz)]
    fn test_corrupt_input(#[case] format: Compression) {
        let err = format.decompress(b"This is not compressed data").unwrap_err();
        assert_eq!(*err, ErrorKind::Corrupt(format));
    }

    #[test]
    fn test_decompress_to_counts_output() {
        let original = vec![b'x'; 70_000];
        let compressed = Compression::Xz.compress(&original).unwrap();
        assert!(compressed.len() < original.len());

        let mut output = Vec::new();
        let size = Compression::Xz.decompress_to(compressed.as_slice(), &mut output).unwrap();
        assert_eq!(size, 70_000);
        assert_eq!(output, original);
    }
}
