use bytes::{Buf, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

/// Longest line emitted in one piece; longer runs are cut into chunks
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits child output into lines.
///
/// The trailing `\n` (and a preceding `\r`) is stripped, invalid UTF-8 is
/// replaced rather than failing the stream, and an unterminated last line
/// is still delivered at end of file.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes already scanned without finding a newline
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_line(src: &mut BytesMut, len: usize, skip: usize) -> String {
        let mut line = &src[..len];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let out = String::from_utf8_lossy(line).into_owned();
        src.advance(len + skip);
        out
    }

    fn take_chunk(src: &mut BytesMut) -> String {
        let len = chunk_end(&src[..]);
        let out = String::from_utf8_lossy(&src[..len]).into_owned();
        src.advance(len);
        out
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Cut point for an overlong line. Moves back over at most three
/// continuation bytes so a UTF-8 sequence is not split; `buf` is longer
/// than [`MAX_LINE_BYTES`].
fn chunk_end(buf: &[u8]) -> usize {
    let mut cut = MAX_LINE_BYTES;
    while cut > MAX_LINE_BYTES - 3 && is_continuation(buf[cut]) {
        cut -= 1;
    }
    if is_continuation(buf[cut]) {
        MAX_LINE_BYTES
    } else {
        cut
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.scanned + offset);

        if let Some(len) = newline.filter(|len| *len <= MAX_LINE_BYTES) {
            self.scanned = 0;
            return Ok(Some(Self::take_line(src, len, 1)));
        }

        if src.len() > MAX_LINE_BYTES {
            self.scanned = 0;
            return Ok(Some(Self::take_chunk(src)));
        }

        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.scanned = 0;
        let len = src.len();
        Ok(Some(Self::take_line(src, len, 0)))
    }
}

/// Frame a child pipe into a stream of lines
pub fn lines<R: AsyncRead>(io: R) -> FramedRead<R, LineCodec> {
    FramedRead::with_capacity(io, LineCodec::new(), 8 * 1024)
}
