//! PNG container wrappers.
//!
//! The payload is stored verbatim as pixel data of a real, viewable PNG: a
//! 4-byte big-endian length header (the first pixel), the payload, zero
//! padding up to a whole pixel, then zero pixels up to a square image. No
//! steganography is involved; the bytes are the image.
//!
//! `png` uses 4-channel (RGBA) pixels; `png3d` uses 3-channel (RGB) pixels,
//! which photo hosts that recompress alpha tend to tolerate better.

use super::Wrapper;
use byteorder::{BigEndian, ByteOrder};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Write;
use stowage_core::{Error, Result, WrapTag};

const SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
const LEN_PREFIX: usize = 4;
const COLOR_RGB: u8 = 2;
const COLOR_RGBA: u8 = 6;

/// 4-channel PNG container.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngWrapper;

/// 3-channel PNG container.
#[derive(Debug, Clone, Copy, Default)]
pub struct Png3dWrapper;

impl Wrapper for PngWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("png")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let padded = pad_for_image(data, 4, 0);
        encode_image(&padded, 4)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let raw = decode_image(data, 4)?;
        strip_padding(&raw)
    }
}

impl Wrapper for Png3dWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("png3d")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        // The extra two tail bytes keep the total a multiple of 3 with the
        // 4-byte length header in front.
        let padded = pad_for_image(data, 3, 2);
        encode_image(&padded, 3)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let raw = decode_image(data, 3)?;
        strip_padding(&raw)
    }
}

/// Length header + payload + zero fill to whole pixels + zero pixels to a
/// square image.
fn pad_for_image(data: &[u8], channels: usize, extra_tail: usize) -> Vec<u8> {
    let tail = (data.len() + channels - 1) / channels * channels - data.len() + extra_tail;
    let mut padded = Vec::with_capacity(LEN_PREFIX + data.len() + tail);
    let mut len = [0u8; LEN_PREFIX];
    BigEndian::write_u32(&mut len, data.len() as u32);
    padded.extend_from_slice(&len);
    padded.extend_from_slice(data);
    padded.resize(padded.len() + tail, 0);
    debug_assert_eq!(padded.len() % channels, 0);

    let pixels = padded.len() / channels;
    let side = square_side(pixels);
    padded.resize(side * side * channels, 0);
    padded
}

fn square_side(pixels: usize) -> usize {
    let mut side = (pixels as f64).sqrt().ceil() as usize;
    while side * side < pixels {
        side += 1;
    }
    side.max(1)
}

fn strip_padding(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < LEN_PREFIX {
        return Err(Error::unwrap_failed("image too small for length header"));
    }
    let stated_len = BigEndian::read_u32(&raw[..LEN_PREFIX]) as usize;
    if raw.len() - LEN_PREFIX < stated_len {
        return Err(Error::unwrap_failed(
            "payload was not as long as stated in the first pixel",
        ));
    }
    Ok(raw[LEN_PREFIX..LEN_PREFIX + stated_len].to_vec())
}

fn color_type(channels: usize) -> u8 {
    if channels == 4 {
        COLOR_RGBA
    } else {
        COLOR_RGB
    }
}

fn encode_image(raw: &[u8], channels: usize) -> Result<Vec<u8>> {
    let pixels = raw.len() / channels;
    let side = square_side(pixels);
    debug_assert_eq!(side * side, pixels);
    let stride = side * channels;

    let mut scanlines = Vec::with_capacity(raw.len() + side);
    for row in raw.chunks(stride) {
        scanlines.push(0u8); // filter type: none
        scanlines.extend_from_slice(row);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&scanlines)
        .and_then(|_| encoder.finish())
        .map(|idat| {
            let mut out = Vec::with_capacity(idat.len() + 64);
            out.extend_from_slice(&SIGNATURE);
            let mut ihdr = [0u8; 13];
            BigEndian::write_u32(&mut ihdr[0..4], side as u32);
            BigEndian::write_u32(&mut ihdr[4..8], side as u32);
            ihdr[8] = 8; // bit depth
            ihdr[9] = color_type(channels);
            // compression, filter, interlace stay 0
            write_chunk(&mut out, b"IHDR", &ihdr);
            write_chunk(&mut out, b"IDAT", &idat);
            write_chunk(&mut out, b"IEND", &[]);
            out
        })
        .map_err(|e| Error::internal(format!("png idat deflate failed: {e}")))
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, data.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    let mut crc = [0u8; 4];
    BigEndian::write_u32(&mut crc, hasher.finalize());
    out.extend_from_slice(&crc);
}

fn decode_image(data: &[u8], channels: usize) -> Result<Vec<u8>> {
    if data.len() < SIGNATURE.len() || data[..SIGNATURE.len()] != SIGNATURE {
        return Err(Error::unwrap_failed("not a png image"));
    }
    let mut pos = SIGNATURE.len();
    let mut width = 0usize;
    let mut height = 0usize;
    let mut seen_ihdr = false;
    let mut idat = Vec::new();

    while pos + 8 <= data.len() {
        let len = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        let kind = &data[pos + 4..pos + 8];
        let body_start = pos + 8;
        let body_end = body_start + len;
        if body_end + 4 > data.len() {
            return Err(Error::unwrap_failed("truncated png chunk"));
        }
        let body = &data[body_start..body_end];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(kind);
        hasher.update(body);
        if hasher.finalize() != BigEndian::read_u32(&data[body_end..body_end + 4]) {
            return Err(Error::unwrap_failed("png chunk crc mismatch"));
        }
        match kind {
            b"IHDR" => {
                if body.len() != 13 {
                    return Err(Error::unwrap_failed("malformed png header"));
                }
                width = BigEndian::read_u32(&body[0..4]) as usize;
                height = BigEndian::read_u32(&body[4..8]) as usize;
                if body[8] != 8 || body[9] != color_type(channels) {
                    return Err(Error::unwrap_failed("unexpected png pixel format"));
                }
                if body[10] != 0 || body[11] != 0 || body[12] != 0 {
                    return Err(Error::unwrap_failed("unsupported png encoding options"));
                }
                seen_ihdr = true;
            }
            b"IDAT" => idat.extend_from_slice(body),
            b"IEND" => break,
            // Ancillary chunks carry no payload bytes of ours.
            _ => {}
        }
        pos = body_end + 4;
    }
    if !seen_ihdr || idat.is_empty() {
        return Err(Error::unwrap_failed("png image is missing required chunks"));
    }

    let mut decoder = ZlibDecoder::new(Vec::new());
    let scanlines = decoder
        .write_all(&idat)
        .and_then(|_| decoder.finish())
        .map_err(|_| Error::unwrap_failed("png idat inflate failed"))?;
    defilter(&scanlines, width, height, channels)
}

fn defilter(scanlines: &[u8], width: usize, height: usize, channels: usize) -> Result<Vec<u8>> {
    let stride = width * channels;
    if scanlines.len() != height * (stride + 1) {
        return Err(Error::unwrap_failed("png scanline data has wrong length"));
    }
    let mut out = vec![0u8; stride * height];
    let mut pos = 0;
    for row in 0..height {
        let filter = scanlines[pos];
        pos += 1;
        let cur = &scanlines[pos..pos + stride];
        pos += stride;
        let row_start = row * stride;
        for x in 0..stride {
            let a = if x >= channels {
                out[row_start + x - channels]
            } else {
                0
            };
            let b = if row > 0 { out[row_start - stride + x] } else { 0 };
            let c = if row > 0 && x >= channels {
                out[row_start - stride + x - channels]
            } else {
                0
            };
            let recon = match filter {
                0 => cur[x],
                1 => cur[x].wrapping_add(a),
                2 => cur[x].wrapping_add(b),
                3 => cur[x].wrapping_add(((a as u16 + b as u16) / 2) as u8),
                4 => cur[x].wrapping_add(paeth(a, b, c)),
                _ => return Err(Error::unwrap_failed("unsupported png filter type")),
            };
            out[row_start + x] = recon;
        }
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_roundtrip() {
        let w = PngWrapper;
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let wrapped = w.wrap(&data).unwrap();
        assert_eq!(&wrapped[..8], &SIGNATURE);
        assert_eq!(w.unwrap(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_rgb_roundtrip() {
        let w = Png3dWrapper;
        let data: Vec<u8> = (0..=255u8).rev().cycle().take(777).collect();
        let wrapped = w.wrap(&data).unwrap();
        assert_eq!(w.unwrap(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_tiny_and_empty() {
        for data in [&b""[..], &b"x"[..], &b"ab"[..], &b"abc"[..], &b"abcd"[..]] {
            assert_eq!(PngWrapper.unwrap(&PngWrapper.wrap(data).unwrap()).unwrap(), data);
            assert_eq!(
                Png3dWrapper.unwrap(&Png3dWrapper.wrap(data).unwrap()).unwrap(),
                data
            );
        }
    }

    #[test]
    fn test_image_is_square() {
        // 100 payload bytes → 104 padded bytes → 26 RGBA pixels → 6x6 image.
        let wrapped = PngWrapper.wrap(&[1u8; 100]).unwrap();
        let ihdr_start = SIGNATURE.len() + 8;
        let width = BigEndian::read_u32(&wrapped[ihdr_start..ihdr_start + 4]);
        let height = BigEndian::read_u32(&wrapped[ihdr_start + 4..ihdr_start + 8]);
        assert_eq!(width, 6);
        assert_eq!(height, 6);
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let wrapped = PngWrapper.wrap(b"payload").unwrap();
        assert!(Png3dWrapper.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_corrupted_chunk_rejected() {
        let mut wrapped = PngWrapper.wrap(b"payload").unwrap();
        let idx = wrapped.len() - 20;
        wrapped[idx] ^= 0x01;
        assert!(PngWrapper.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_not_a_png_rejected() {
        assert!(PngWrapper.unwrap(b"GIF89a...").is_err());
    }
}
