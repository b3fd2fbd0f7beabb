// Number <-> text conversion. Locale independent in both directions.

/// Largest magnitude printed in plain integer form
const INTEGER_FORMAT_LIMIT: f64 = 1e15;

/// Format a number in the shortest form that parses back to the same value.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < INTEGER_FORMAT_LIMIT {
        let mut buffer = itoa::Buffer::new();
        return buffer.format(n as i64).to_string();
    }
    let magnitude = n.abs();
    if magnitude >= 1e16 || magnitude < 1e-4 {
        // Rust's exponent form is shortest round-trip as well
        format!("{:e}", n)
    } else {
        format!("{}", n)
    }
}

/// Parse a numeric string: decimal with optional fraction and exponent, or
/// `0x` hexadecimal with optional fraction. Surrounding whitespace is ignored.
pub fn parse_number(bytes: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    let (negative, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let value = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        parse_hex(hex)?
    } else {
        parse_decimal(body)?
    };
    Some(if negative { -value } else { value })
}

fn parse_hex(digits: &str) -> Option<f64> {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(value)
}

fn parse_decimal(body: &str) -> Option<f64> {
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut mantissa_digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exponent_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exponent_start {
            return None;
        }
    }
    if i != bytes.len() {
        return None;
    }
    body.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_integers_plainly() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn formats_fractions_round_trip() {
        for n in [0.1, 1.5, -3.25, 123.456, 1e-7, 2.5e20, 1.0 / 3.0] {
            let text = format_number(n);
            assert_eq!(parse_number(text.as_bytes()), Some(n), "{}", text);
        }
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1e300), "1e300");
    }

    #[test]
    fn formats_specials() {
        assert_eq!(format_number(f64::NAN), "nan");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(parse_number(b"  10  "), Some(10.0));
        assert_eq!(parse_number(b"-2.5e3"), Some(-2500.0));
        assert_eq!(parse_number(b".5"), Some(0.5));
        assert_eq!(parse_number(b"0x1F"), Some(31.0));
        assert_eq!(parse_number(b"0x.8"), Some(0.5));
    }

    #[test]
    fn rejects_non_numbers() {
        for text in ["", "abc", "1e", "inf", "nan", "1.2.3", "0x", "--1", "1 2"] {
            assert_eq!(parse_number(text.as_bytes()), None, "{}", text);
        }
    }
}
