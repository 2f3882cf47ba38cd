//! Gzip detection, transport-encoding negotiation and stream helpers.

use std::io::{self, Cursor, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// The first two bytes of every gzip member.
pub const MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Suffix appended to on-disk names of storage-compressed objects.
pub const STORAGE_SUFFIX: &str = ".gz";

/// A request or response `Content-Encoding` this service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value. Returns the unrecognised value on failure.
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Ok(ContentEncoding::Identity),
            Some("gzip") | Some("x-gzip") => Ok(ContentEncoding::Gzip),
            Some(other) => Err(other.to_string()),
        }
    }
}

/// Whether the bytes begin with the gzip magic number.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

/// Peek at the start of a stream for the gzip magic number.
///
/// Returns the verdict together with a reader that still yields every byte.
pub fn sniff<R: Read>(mut reader: R) -> io::Result<(bool, io::Chain<Cursor<Vec<u8>>, R>)> {
    let mut head = Vec::with_capacity(MAGIC.len());
    (&mut reader).take(MAGIC.len() as u64).read_to_end(&mut head)?;
    Ok((has_magic(&head), Cursor::new(head).chain(reader)))
}

/// Wrap a reader so it yields decompressed bytes. Concatenated members are supported.
pub fn decoder<R: Read>(reader: R) -> MultiGzDecoder<R> {
    MultiGzDecoder::new(reader)
}

/// Gzip an in-memory buffer.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gunzip an in-memory buffer.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Whether an `Accept-Encoding` header allows a gzip response.
///
/// An absent header means the client accepts the common encodings.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let Some(header) = accept_encoding else {
        return true;
    };
    if header.trim().is_empty() {
        return true;
    }
    header.split(',').any(|item| {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim();
        if coding != "*" && !coding.eq_ignore_ascii_case("gzip") && !coding.eq_ignore_ascii_case("x-gzip") {
            return false;
        }
        // an explicit q=0 refuses the coding
        !parts.any(|param| {
            let param = param.trim();
            param
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        })
    })
}

/// Compare two streams byte for byte.
pub fn same_contents<A: Read, B: Read>(mut a: A, mut b: B) -> io::Result<bool> {
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = read_full(&mut a, &mut buf_a)?;
        let m = read_full(&mut b, &mut buf_b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_detects_and_preserves_bytes() {
        let gz = compress(b"hello").unwrap();
        let (compressed, mut reader) = sniff(&gz[..]).unwrap();
        assert!(compressed);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, gz);

        let (compressed, mut reader) = sniff(&b"plain"[..]).unwrap();
        assert!(!compressed);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"plain");
    }

    #[test]
    fn test_sniff_short_input() {
        let (compressed, _) = sniff(&[0x1fu8][..]).unwrap();
        assert!(!compressed);
        let (compressed, _) = sniff(&b""[..]).unwrap();
        assert!(!compressed);
    }

    #[test]
    fn test_decompress_concatenated_members() {
        let mut data = compress(b"one ").unwrap();
        data.extend(compress(b"two").unwrap());
        assert_eq!(decompress(&data).unwrap(), b"one two");
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"\x1f\x8bnot really gzip").is_err());
    }

    #[test]
    fn test_accepts_gzip() {
        assert!(accepts_gzip(None));
        assert!(accepts_gzip(Some("")));
        assert!(accepts_gzip(Some("gzip")));
        assert!(accepts_gzip(Some("deflate, gzip;q=0.5")));
        assert!(accepts_gzip(Some("x-gzip")));
        assert!(!accepts_gzip(Some("identity")));
        assert!(!accepts_gzip(Some("br, deflate")));
        assert!(!accepts_gzip(Some("gzip;q=0")));
        assert!(accepts_gzip(Some("*")));
        assert!(!accepts_gzip(Some("*;q=0")));
    }

    #[test]
    fn test_parse_content_encoding() {
        assert_eq!(ContentEncoding::parse(None), Ok(ContentEncoding::Identity));
        assert_eq!(ContentEncoding::parse(Some("GZIP")), Ok(ContentEncoding::Gzip));
        assert_eq!(ContentEncoding::parse(Some("br")), Err("br".to_string()));
    }

    #[test]
    fn test_same_contents() {
        assert!(same_contents(&b"abc"[..], &b"abc"[..]).unwrap());
        assert!(!same_contents(&b"abc"[..], &b"abd"[..]).unwrap());
        assert!(!same_contents(&b"abc"[..], &b"abcd"[..]).unwrap());
        assert!(!same_contents(&b"abcd"[..], &b"ab"[..]).unwrap());
        assert!(same_contents(&b""[..], &b""[..]).unwrap());
    }
}
