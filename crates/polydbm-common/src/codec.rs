//! Fixed-width value encodings
//!
//! Integers are 8-byte big-endian two's complement, floats are 8-byte
//! big-endian IEEE 754 doubles.

/// Serialize an integer as 8 big-endian bytes
pub fn serialize_int(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Deserialize a big-endian integer
///
/// Inputs shorter than 8 bytes are read as an unsigned big-endian number;
/// only the first 8 bytes of longer inputs are used.
pub fn deserialize_int(data: &[u8]) -> i64 {
    if data.len() >= 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[..8]);
        return i64::from_be_bytes(buf);
    }
    data.iter().fold(0i64, |acc, b| (acc << 8) | i64::from(*b))
}

/// Serialize a float as 8 big-endian bytes
pub fn serialize_float(value: f64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Deserialize a big-endian float; NaN for inputs shorter than 8 bytes
pub fn deserialize_float(data: &[u8]) -> f64 {
    if data.len() < 8 {
        return f64::NAN;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    f64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_layout() {
        assert_eq!(serialize_int(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(serialize_int(-1), [0xFF; 8]);
        assert_eq!(deserialize_int(&serialize_int(i64::MIN)), i64::MIN);
        assert_eq!(deserialize_int(&[0x01, 0x00]), 256);
        assert_eq!(deserialize_int(&[]), 0);
    }

    #[test]
    fn test_float_layout() {
        assert_eq!(serialize_float(1.0), [0x3F, 0xF0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(deserialize_float(&serialize_float(-2.5)), -2.5);
        assert!(deserialize_float(b"abc").is_nan());
    }
}
