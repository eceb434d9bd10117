use std::collections::HashMap;
use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

mod combine;

use combine::{combine_crc32, ieee_matrix};

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_OS_UNKNOWN: u8 = 0xff;
const GZIP_HEADER_LEN: usize = 10;
const GZIP_TRAILER_LEN: usize = 8;

// Empty stored block emitted by a sync flush; keeps BFINAL=0 and realigns
// the stream to a byte boundary.
const SYNC_FLUSH_FOOTER: [u8; 5] = [0x00, 0x00, 0x00, 0xff, 0xff];

const STORED_HEADER_LEN: usize = 5;
const STORED_BLOCK_MAX: usize = u16::MAX as usize;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    HuffmanOnly = -2,
    DefaultCompression = -1,
    NoCompression = 0,
    BestSpeed = 1,
    BestCompression = 9,
}

impl Level {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            -2 => Some(Self::HuffmanOnly),
            -1 => Some(Self::DefaultCompression),
            0 => Some(Self::NoCompression),
            1 => Some(Self::BestSpeed),
            9 => Some(Self::BestCompression),
            _ => None,
        }
    }

    fn to_flate2(self) -> Compression {
        match self {
            Self::NoCompression => Compression::none(),
            Self::BestSpeed | Self::HuffmanOnly => Compression::fast(),
            Self::DefaultCompression => Compression::default(),
            Self::BestCompression => Compression::best(),
        }
    }

    fn xfl(self) -> u8 {
        match self {
            Self::BestCompression => 2,
            Self::BestSpeed => 4,
            _ => 0,
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::DefaultCompression
    }
}

#[derive(Debug, Error)]
pub enum GzipTemplateError {
    #[error("no matching end delimiter {end_tag:?} for the tag opened at byte {offset}")]
    MissingEndTag { end_tag: String, offset: usize },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type TagFunc = Box<dyn Fn(&mut TagWriter<'_>, &[u8]) -> io::Result<()> + Send + Sync>;

pub enum TagValue {
    Bytes(Vec<u8>),
    Text(String),
    Func(TagFunc),
}

impl From<Vec<u8>> for TagValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for TagValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

pub type TagMap = HashMap<Vec<u8>, TagValue>;

#[derive(Debug)]
struct Segment {
    deflate: Vec<u8>,
    size: u64,
    crc: u32,
}

#[derive(Debug)]
enum Body {
    // Complete gzip member built at construction; used when the template
    // contains no placeholders.
    Full(Vec<u8>),
    Segmented {
        segments: Vec<Segment>,
        tags: Vec<Vec<u8>>,
        static_size: u32,
    },
}

#[derive(Debug)]
pub struct Template {
    gzip_hdr: [u8; GZIP_HEADER_LEN],
    body: Body,
}

struct StitchState {
    crc: u32,
    size: u32,
    written: u64,
    wrote: bool,
}

pub struct TagWriter<'a> {
    sink: &'a mut dyn Write,
    state: &'a mut StitchState,
}

impl Write for TagWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.state.wrote = true;
        for chunk in buf.chunks(STORED_BLOCK_MAX) {
            let len = chunk.len() as u16;
            let mut hdr = [0u8; STORED_HEADER_LEN];
            hdr[1..3].copy_from_slice(&len.to_le_bytes());
            hdr[3..5].copy_from_slice(&(!len).to_le_bytes());
            self.sink.write_all(&hdr)?;
            self.sink.write_all(chunk)?;

            let mut hasher = crc32fast::Hasher::new_with_initial(self.state.crc);
            hasher.update(chunk);
            self.state.crc = hasher.finalize();
            self.state.size = self.state.size.wrapping_add(chunk.len() as u32);
            self.state.written += (STORED_HEADER_LEN + chunk.len()) as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl Template {
    pub fn new(
        template: &[u8],
        start_tag: &[u8],
        end_tag: &[u8],
        level: Level,
    ) -> Result<Self, GzipTemplateError> {
        assert!(!start_tag.is_empty(), "start tag must not be empty");
        assert!(!end_tag.is_empty(), "end tag must not be empty");

        let gzip_hdr = gzip_header(level);

        if find(template, start_tag).is_none() {
            let full = compress_full_member(template, level, &gzip_hdr)?;
            return Ok(Self {
                gzip_hdr,
                body: Body::Full(full),
            });
        }

        let mut segments = Vec::new();
        let mut tags = Vec::new();
        let mut static_size: u32 = 0;

        let mut rest = template;

        loop {
            let next = find(rest, start_tag);
            let text = &rest[..next.unwrap_or(rest.len())];

            // Each segment is an independent deflate stream. Segments that a
            // tag follows are sync-flushed and abandoned mid-stream, so their
            // bytes stay byte-aligned with BFINAL=0 throughout; the last
            // segment is finished and carries the stream's only BFINAL=1
            // block. The write-side reset() is unusable here: it finishes
            // the current stream into the old buffer before swapping.
            let mut encoder = DeflateEncoder::new(Vec::new(), level.to_flate2());
            encoder.write_all(text)?;
            let mut deflate = if next.is_none() {
                encoder.finish()?
            } else {
                encoder.flush()?;
                std::mem::take(encoder.get_mut())
            };

            // Flushed segments drop the trailing sync marker; the stored
            // block that follows always starts with a 0x00 header byte,
            // which restores the stripped alignment bits. A finished
            // segment keeps its tail as-is.
            if next.is_some() && deflate.ends_with(&SYNC_FLUSH_FOOTER) {
                deflate.truncate(deflate.len() - SYNC_FLUSH_FOOTER.len());
            }

            static_size = static_size.wrapping_add(text.len() as u32);
            segments.push(Segment {
                deflate,
                size: text.len() as u64,
                crc: crc32fast::hash(text),
            });

            let Some(n) = next else {
                break;
            };
            rest = &rest[n + start_tag.len()..];

            let Some(e) = find(rest, end_tag) else {
                return Err(GzipTemplateError::MissingEndTag {
                    end_tag: String::from_utf8_lossy(end_tag).into_owned(),
                    offset: template.len() - rest.len(),
                });
            };
            tags.push(rest[..e].to_vec());
            rest = &rest[e + end_tag.len()..];
        }

        Ok(Self {
            gzip_hdr,
            body: Body::Segmented {
                segments,
                tags,
                static_size,
            },
        })
    }

    pub fn execute_func<W, F>(&self, w: &mut W, mut f: F) -> Result<u64, GzipTemplateError>
    where
        W: Write,
        F: FnMut(&mut TagWriter<'_>, &[u8]) -> io::Result<()>,
    {
        let (segments, tags, static_size) = match &self.body {
            Body::Full(full) => {
                w.write_all(full)?;
                return Ok(full.len() as u64);
            }
            Body::Segmented {
                segments,
                tags,
                static_size,
            } => (segments, tags, *static_size),
        };

        let mut nn = 0u64;

        w.write_all(&self.gzip_hdr)?;
        nn += GZIP_HEADER_LEN as u64;

        let mat = ieee_matrix();
        let mut state = StitchState {
            crc: segments[0].crc,
            size: static_size,
            written: 0,
            wrote: false,
        };

        for (i, tag) in tags.iter().enumerate() {
            let seg = &segments[i];
            w.write_all(&seg.deflate)?;
            nn += seg.deflate.len() as u64;
            if i > 0 {
                state.crc = combine_crc32(mat, state.crc, seg.crc, seg.size);
            }

            state.wrote = false;
            {
                let mut tw = TagWriter {
                    sink: &mut *w,
                    state: &mut state,
                };
                f(&mut tw, tag)?;
            }

            // A placeholder that produced no bytes still needs one block
            // between the surrounding segments.
            if !state.wrote {
                w.write_all(&SYNC_FLUSH_FOOTER)?;
                nn += SYNC_FLUSH_FOOTER.len() as u64;
            }
        }

        // The last segment already ends in the stream's BFINAL=1 block.
        let last = &segments[tags.len()];
        w.write_all(&last.deflate)?;
        nn += last.deflate.len() as u64;
        let digest = combine_crc32(mat, state.crc, last.crc, last.size);

        let mut trailer = [0u8; GZIP_TRAILER_LEN];
        trailer[..4].copy_from_slice(&digest.to_le_bytes());
        trailer[4..].copy_from_slice(&state.size.to_le_bytes());
        w.write_all(&trailer)?;
        nn += GZIP_TRAILER_LEN as u64 + state.written;

        Ok(nn)
    }

    pub fn execute<W: Write>(&self, w: &mut W, m: &TagMap) -> Result<u64, GzipTemplateError> {
        self.execute_func(w, |w, tag| write_tag_value(w, tag, m))
    }

    pub fn execute_func_to_vec<F>(&self, f: F) -> Result<Vec<u8>, GzipTemplateError>
    where
        F: FnMut(&mut TagWriter<'_>, &[u8]) -> io::Result<()>,
    {
        let mut out = Vec::with_capacity(self.output_size_hint());
        self.execute_func(&mut out, f)?;
        Ok(out)
    }

    pub fn execute_to_vec(&self, m: &TagMap) -> Result<Vec<u8>, GzipTemplateError> {
        self.execute_func_to_vec(|w, tag| write_tag_value(w, tag, m))
    }

    fn output_size_hint(&self) -> usize {
        match &self.body {
            Body::Full(full) => full.len(),
            Body::Segmented { segments, tags, .. } => {
                let static_len: usize = segments.iter().map(|seg| seg.deflate.len()).sum();
                GZIP_HEADER_LEN
                    + static_len
                    + tags.len() * (STORED_HEADER_LEN + 16)
                    + GZIP_TRAILER_LEN
            }
        }
    }
}

fn write_tag_value(w: &mut TagWriter<'_>, tag: &[u8], m: &TagMap) -> io::Result<()> {
    match m.get(tag) {
        None => Ok(()),
        Some(TagValue::Bytes(value)) => w.write_all(value),
        Some(TagValue::Text(value)) => w.write_all(value.as_bytes()),
        Some(TagValue::Func(value)) => value(w, tag),
    }
}

fn gzip_header(level: Level) -> [u8; GZIP_HEADER_LEN] {
    let mut hdr = [0u8; GZIP_HEADER_LEN];
    hdr[0] = GZIP_ID1;
    hdr[1] = GZIP_ID2;
    hdr[2] = GZIP_CM_DEFLATE;
    hdr[8] = level.xfl();
    hdr[9] = GZIP_OS_UNKNOWN;
    hdr
}

fn compress_full_member(
    template: &[u8],
    level: Level,
    hdr: &[u8; GZIP_HEADER_LEN],
) -> Result<Vec<u8>, GzipTemplateError> {
    let mut out = Vec::with_capacity(GZIP_HEADER_LEN + template.len() / 2 + GZIP_TRAILER_LEN + 16);
    out.extend_from_slice(hdr);

    let mut encoder = DeflateEncoder::new(out, level.to_flate2());
    encoder.write_all(template)?;
    let mut out = encoder.finish()?;

    out.extend_from_slice(&crc32fast::hash(template).to_le_bytes());
    out.extend_from_slice(&(template.len() as u32).to_le_bytes());
    Ok(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
