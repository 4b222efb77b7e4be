//! Adalight wire protocol

use bytes::{BufMut, BytesMut};

use crate::color::ColorRgb;

/// Magic bytes starting every frame
pub const MAGIC: &[u8; 3] = b"Ada";

/// Size of the frame header: magic, count and checksum
pub const HEADER_LEN: usize = 6;

/// Encoded size of a frame of `led_count` pixels
pub fn encoded_len(led_count: usize) -> usize {
    HEADER_LEN + 3 * led_count
}

/// Header bytes following the magic for a frame of `led_count` pixels
pub fn count_header(led_count: usize) -> [u8; 3] {
    let count = led_count as i32 - 1;
    let hi = ((count >> 8) & 0xFF) as u8;
    let lo = (count & 0xFF) as u8;
    [hi, lo, hi ^ lo ^ 0x55]
}

/// Append the encoded `frame` to `dst`
pub fn encode(frame: &[ColorRgb], dst: &mut BytesMut) {
    dst.reserve(encoded_len(frame.len()));

    dst.put_slice(MAGIC);
    dst.put_slice(&count_header(frame.len()));

    for color in frame {
        dst.put_u8(color.red);
        dst.put_u8(color.green);
        dst.put_u8(color.blue);
    }
}
