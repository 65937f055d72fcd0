//! Key comparators for ordered back-ends
//!
//! Pair comparators work on composite keys encoded by
//! [`serialize_str_pair`]: a varint length of the outer key, the outer key,
//! then the inner value. They order by the outer key first.

use polydbm_common::{deserialize_float, deserialize_int, Status};
use std::cmp::Ordering;

/// Named comparison functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyComparator {
    #[default]
    Lexical,
    LexicalCase,
    Decimal,
    Hexadecimal,
    RealNumber,
    SignedBigEndian,
    FloatBigEndian,
    PairLexical,
    PairLexicalCase,
    PairDecimal,
    PairHexadecimal,
    PairRealNumber,
    PairSignedBigEndian,
    PairFloatBigEndian,
}

impl KeyComparator {
    const ALL: [KeyComparator; 14] = [
        KeyComparator::Lexical,
        KeyComparator::LexicalCase,
        KeyComparator::Decimal,
        KeyComparator::Hexadecimal,
        KeyComparator::RealNumber,
        KeyComparator::SignedBigEndian,
        KeyComparator::FloatBigEndian,
        KeyComparator::PairLexical,
        KeyComparator::PairLexicalCase,
        KeyComparator::PairDecimal,
        KeyComparator::PairHexadecimal,
        KeyComparator::PairRealNumber,
        KeyComparator::PairSignedBigEndian,
        KeyComparator::PairFloatBigEndian,
    ];

    /// Full name as accepted by the `key_comparator` param
    pub fn name(self) -> &'static str {
        match self {
            KeyComparator::Lexical => "LexicalKeyComparator",
            KeyComparator::LexicalCase => "LexicalCaseKeyComparator",
            KeyComparator::Decimal => "DecimalKeyComparator",
            KeyComparator::Hexadecimal => "HexadecimalKeyComparator",
            KeyComparator::RealNumber => "RealNumberKeyComparator",
            KeyComparator::SignedBigEndian => "SignedBigEndianKeyComparator",
            KeyComparator::FloatBigEndian => "FloatBigEndianKeyComparator",
            KeyComparator::PairLexical => "PairLexicalKeyComparator",
            KeyComparator::PairLexicalCase => "PairLexicalCaseKeyComparator",
            KeyComparator::PairDecimal => "PairDecimalKeyComparator",
            KeyComparator::PairHexadecimal => "PairHexadecimalKeyComparator",
            KeyComparator::PairRealNumber => "PairRealNumberKeyComparator",
            KeyComparator::PairSignedBigEndian => "PairSignedBigEndianKeyComparator",
            KeyComparator::PairFloatBigEndian => "PairFloatBigEndianKeyComparator",
        }
    }

    /// Look up a comparator by full or short name (case-insensitive)
    pub fn from_name(name: &str) -> Result<Self, Status> {
        let wanted = name.trim().to_ascii_lowercase();
        let wanted = wanted.strip_suffix("keycomparator").unwrap_or(&wanted);
        Self::ALL
            .iter()
            .copied()
            .find(|c| {
                let full = c.name().to_ascii_lowercase();
                full.strip_suffix("keycomparator") == Some(wanted)
            })
            .ok_or_else(|| Status::invalid_argument(format!("unknown comparator: {}", name)))
    }

    pub fn is_pair(self) -> bool {
        matches!(
            self,
            KeyComparator::PairLexical
                | KeyComparator::PairLexicalCase
                | KeyComparator::PairDecimal
                | KeyComparator::PairHexadecimal
                | KeyComparator::PairRealNumber
                | KeyComparator::PairSignedBigEndian
                | KeyComparator::PairFloatBigEndian
        )
    }

    /// The single-key comparator a pair comparator applies to each half
    pub fn base(self) -> KeyComparator {
        match self {
            KeyComparator::PairLexical => KeyComparator::Lexical,
            KeyComparator::PairLexicalCase => KeyComparator::LexicalCase,
            KeyComparator::PairDecimal => KeyComparator::Decimal,
            KeyComparator::PairHexadecimal => KeyComparator::Hexadecimal,
            KeyComparator::PairRealNumber => KeyComparator::RealNumber,
            KeyComparator::PairSignedBigEndian => KeyComparator::SignedBigEndian,
            KeyComparator::PairFloatBigEndian => KeyComparator::FloatBigEndian,
            other => other,
        }
    }

    /// The pair comparator built on this one
    pub fn pair(self) -> KeyComparator {
        match self {
            KeyComparator::Lexical => KeyComparator::PairLexical,
            KeyComparator::LexicalCase => KeyComparator::PairLexicalCase,
            KeyComparator::Decimal => KeyComparator::PairDecimal,
            KeyComparator::Hexadecimal => KeyComparator::PairHexadecimal,
            KeyComparator::RealNumber => KeyComparator::PairRealNumber,
            KeyComparator::SignedBigEndian => KeyComparator::PairSignedBigEndian,
            KeyComparator::FloatBigEndian => KeyComparator::PairFloatBigEndian,
            other => other,
        }
    }

    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        if self.is_pair() {
            let base = self.base();
            let (a_outer, a_inner) = deserialize_str_pair(a);
            let (b_outer, b_inner) = deserialize_str_pair(b);
            return base
                .compare(a_outer, b_outer)
                .then_with(|| base.compare(a_inner, b_inner));
        }
        match self {
            KeyComparator::LexicalCase => {
                let a = a.iter().map(u8::to_ascii_lowercase);
                let b = b.iter().map(u8::to_ascii_lowercase);
                a.cmp(b)
            }
            KeyComparator::Decimal => parse_decimal(a).cmp(&parse_decimal(b)),
            KeyComparator::Hexadecimal => parse_hex(a).cmp(&parse_hex(b)),
            KeyComparator::RealNumber => compare_f64(parse_real(a), parse_real(b)),
            KeyComparator::SignedBigEndian => deserialize_int(a).cmp(&deserialize_int(b)),
            KeyComparator::FloatBigEndian => {
                compare_f64(deserialize_float(a), deserialize_float(b))
            }
            _ => a.cmp(b),
        }
    }
}

// NaN sorts before every number.
fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn skip_spaces(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

/// Leading decimal integer of the text, 0 if there is none
pub fn parse_decimal(data: &[u8]) -> i64 {
    let mut rest = skip_spaces(data);
    let mut negative = false;
    if let Some((&sign, tail)) = rest.split_first() {
        if sign == b'-' || sign == b'+' {
            negative = sign == b'-';
            rest = tail;
        }
    }
    let mut value: i64 = 0;
    for &b in rest.iter().take_while(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}

/// Leading hexadecimal integer of the text, 0 if there is none
pub fn parse_hex(data: &[u8]) -> u64 {
    let mut rest = skip_spaces(data);
    if rest.len() >= 2 && rest[0] == b'0' && (rest[1] == b'x' || rest[1] == b'X') {
        rest = &rest[2..];
    }
    let mut value: u64 = 0;
    for &b in rest.iter() {
        let digit = match (b as char).to_digit(16) {
            Some(d) => u64::from(d),
            None => break,
        };
        value = value.wrapping_shl(4) | digit;
    }
    value
}

/// Leading real number of the text, 0.0 if there is none
pub fn parse_real(data: &[u8]) -> f64 {
    let rest = skip_spaces(data);
    let end = rest
        .iter()
        .position(|b| !(b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E')))
        .unwrap_or(rest.len());
    let text = match std::str::from_utf8(&rest[..end]) {
        Ok(text) => text,
        Err(_) => return 0.0,
    };
    let lowered = String::from_utf8_lossy(rest).to_ascii_lowercase();
    if lowered.starts_with("inf") || lowered.starts_with("+inf") {
        return f64::INFINITY;
    }
    if lowered.starts_with("-inf") {
        return f64::NEG_INFINITY;
    }
    if lowered.starts_with("nan") {
        return f64::NAN;
    }
    (1..=text.len())
        .rev()
        .find_map(|len| text[..len].parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode an (outer, inner) pair as one composite key
pub fn serialize_str_pair(outer: &[u8], inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(outer.len() + inner.len() + 2);
    write_varint(&mut out, outer.len() as u64);
    out.extend_from_slice(outer);
    out.extend_from_slice(inner);
    out
}

/// Decode a composite key; malformed input is read as an outer key alone
pub fn deserialize_str_pair(data: &[u8]) -> (&[u8], &[u8]) {
    match read_varint(data) {
        Some((len, used)) if (len as usize) <= data.len() - used => {
            let body = &data[used..];
            body.split_at(len as usize)
        }
        _ => (data, &data[..0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for c in KeyComparator::ALL {
            assert_eq!(KeyComparator::from_name(c.name()).unwrap(), c);
        }
        assert_eq!(
            KeyComparator::from_name("pairlexical").unwrap(),
            KeyComparator::PairLexical
        );
        assert!(KeyComparator::from_name("Bogus").is_err());
    }

    #[test]
    fn test_numeric_comparators() {
        let dec = KeyComparator::Decimal;
        assert_eq!(dec.compare(b"9", b"10"), Ordering::Less);
        assert_eq!(dec.compare(b"-5", b"3"), Ordering::Less);
        assert_eq!(dec.compare(b" 42abc", b"42"), Ordering::Equal);

        let hex = KeyComparator::Hexadecimal;
        assert_eq!(hex.compare(b"ff", b"0x100"), Ordering::Less);

        let real = KeyComparator::RealNumber;
        assert_eq!(real.compare(b"1.5", b"1.25"), Ordering::Greater);
        assert_eq!(real.compare(b"-inf", b"-1e300"), Ordering::Less);
        assert_eq!(parse_real(b"2.5e1x"), 25.0);
    }

    #[test]
    fn test_binary_comparators() {
        let sbe = KeyComparator::SignedBigEndian;
        assert_eq!(
            sbe.compare(&(-1i64).to_be_bytes(), &1i64.to_be_bytes()),
            Ordering::Less
        );
        let fbe = KeyComparator::FloatBigEndian;
        assert_eq!(
            fbe.compare(&(-0.5f64).to_be_bytes(), &0.25f64.to_be_bytes()),
            Ordering::Less
        );
    }

    #[test]
    fn test_case_fold() {
        let c = KeyComparator::LexicalCase;
        assert_eq!(c.compare(b"Apple", b"apple"), Ordering::Equal);
        assert_eq!(c.compare(b"apple", b"Banana"), Ordering::Less);
    }

    #[test]
    fn test_pair_encoding_and_order() {
        let key = serialize_str_pair(b"general", b"anne");
        assert_eq!(deserialize_str_pair(&key), (&b"general"[..], &b"anne"[..]));

        let c = KeyComparator::PairLexical;
        let a = serialize_str_pair(b"ab", b"z");
        let b = serialize_str_pair(b"abc", b"a");
        // Outer key decides before the inner value.
        assert_eq!(c.compare(&a, &b), Ordering::Less);
        let c1 = serialize_str_pair(b"sales", b"anne");
        let c2 = serialize_str_pair(b"sales", b"gilbert");
        assert_eq!(c.compare(&c1, &c2), Ordering::Less);

        let long = vec![b'x'; 300];
        let key = serialize_str_pair(&long, b"v");
        assert_eq!(deserialize_str_pair(&key), (&long[..], &b"v"[..]));
    }
}
