//! Standard instrument codes: `EXCHANGE.CODE[.SUFFIX]`.

/// Split a standard code into `(exchange, rest)`.
/// A code without a dot has an empty exchange.
pub fn split_std_code(code: &str) -> (&str, &str) {
    match code.split_once('.') {
        Some((exchg, rest)) => (exchg, rest),
        None => ("", code),
    }
}

/// Strip adjustment markers from a standard code.
///
/// `SSE.600000Q` (forward adjusted), `SSE.600000H` (backward adjusted) and the
/// `+`/`-` continuous-contract marks all map back to the raw code.
pub fn raw_std_code(code: &str) -> String {
    let trimmed = code.trim();
    if let Some(stripped) = trimmed.strip_suffix(&['+', '-'][..]) {
        return stripped.to_string();
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let last = bytes[bytes.len() - 1];
        let prev = bytes[bytes.len() - 2];
        if (last == b'Q' || last == b'H') && prev.is_ascii_digit() {
            return trimmed[..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split_std_code("SSE.600000"), ("SSE", "600000"));
        assert_eq!(split_std_code("CFFEX.IF.HOT"), ("CFFEX", "IF.HOT"));
        assert_eq!(split_std_code("600000"), ("", "600000"));
    }

    #[test]
    fn test_raw_code() {
        assert_eq!(raw_std_code("SSE.600000Q"), "SSE.600000");
        assert_eq!(raw_std_code("SSE.600000H"), "SSE.600000");
        assert_eq!(raw_std_code("CFFEX.IF.HOT+"), "CFFEX.IF.HOT");
        assert_eq!(raw_std_code("CFFEX.IF.HOT"), "CFFEX.IF.HOT");
        assert_eq!(raw_std_code("SHFE.rb2405"), "SHFE.rb2405");
    }
}
