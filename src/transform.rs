//! Case-flipping byte transform applied to every echoed buffer.

/// XOR mask that toggles an ASCII letter between upper and lower case.
const CASE_BIT: u8 = b' ';

/// Flip the case of every ASCII letter in `buf`, in place.
///
/// All other bytes pass through unchanged, so applying it twice restores
/// the original input for any byte sequence.
pub fn flip_case(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        if byte.is_ascii_alphabetic() {
            *byte ^= CASE_BIT;
        }
    }
}
