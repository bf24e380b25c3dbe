//! Incremental JPEG frame extraction from an MJPEG byte stream.
//!
//! Multipart boundaries and part headers are ignored; the extractor looks for
//! an SOI marker and then walks the JPEG segment structure to the matching EOI.
//! Walking segments (instead of searching for `FF D9`) keeps embedded EXIF
//! thumbnails from ending a frame early.

use crate::error::IngestError;

const SOI: [u8; 2] = [0xFF, 0xD8];

/// Default upper bound for a single frame.
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Complete(usize),
    NeedMore,
    Corrupt,
}

#[derive(Debug)]
pub struct FrameExtractor {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameExtractor {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            max_frame_bytes,
        }
    }

    /// Feed the next chunk. Returns the first complete frame once one is available.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, IngestError> {
        self.buf.extend_from_slice(chunk);

        loop {
            let Some(start) = find_soi(&self.buf) else {
                // Keep a trailing 0xFF in case the marker straddles chunks.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop_to = self.buf.len() - keep;
                self.buf.drain(..drop_to);
                return Ok(None);
            };

            if start > 0 {
                self.buf.drain(..start);
            }

            match scan_frame(&self.buf) {
                Scan::Complete(end) => {
                    let frame: Vec<u8> = self.buf.drain(..end).collect();
                    return Ok(Some(frame));
                }
                Scan::NeedMore => {
                    if self.buf.len() > self.max_frame_bytes {
                        return Err(IngestError::InvalidImage(format!(
                            "MJPEG frame exceeds {} bytes",
                            self.max_frame_bytes
                        )));
                    }
                    return Ok(None);
                }
                Scan::Corrupt => {
                    // Skip this SOI and look for the next one.
                    self.buf.drain(..SOI.len());
                }
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_soi(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == SOI)
}

fn segment_len(data: &[u8], at: usize) -> Option<usize> {
    let hi = *data.get(at)? as usize;
    let lo = *data.get(at + 1)? as usize;
    Some((hi << 8) | lo)
}

/// Walk the segments of a JPEG that starts at `data[0]`.
fn scan_frame(data: &[u8]) -> Scan {
    let mut i = SOI.len();

    loop {
        if i + 1 >= data.len() {
            return Scan::NeedMore;
        }
        if data[i] != 0xFF {
            return Scan::Corrupt;
        }

        let marker = data[i + 1];
        match marker {
            // fill byte
            0xFF => i += 1,
            0xD9 => return Scan::Complete(i + 2),
            // standalone markers
            0x01 | 0xD0..=0xD7 => i += 2,
            0xD8 | 0x00 => return Scan::Corrupt,
            0xDA => {
                let Some(len) = segment_len(data, i + 2) else {
                    return Scan::NeedMore;
                };
                if len < 2 {
                    return Scan::Corrupt;
                }
                i += 2 + len;

                // Entropy-coded data: FF 00 is a stuffed byte, FF D0-D7 restart markers.
                loop {
                    if i + 1 >= data.len() {
                        return Scan::NeedMore;
                    }
                    if data[i] == 0xFF {
                        let next = data[i + 1];
                        if next == 0x00 || (0xD0..=0xD7).contains(&next) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            _ => {
                let Some(len) = segment_len(data, i + 2) else {
                    return Scan::NeedMore;
                };
                if len < 2 {
                    return Scan::Corrupt;
                }
                i += 2 + len;
            }
        }
    }
}
