use crate::error::{ForecastError, Result};

const MAX_SYMBOL_LEN: usize = 15;

/// Trim and upper-case a ticker, rejecting anything that could not be a
/// listed symbol. Symbols end up in artifact file names, so path separators
/// and other punctuation are refused here.
pub fn normalize_symbol(input: &str) -> Result<String> {
    let normalized = input.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(ForecastError::Config("symbol is empty".to_string()));
    }
    if normalized.len() > MAX_SYMBOL_LEN {
        return Err(ForecastError::Config(format!(
            "symbol '{}' is longer than {} characters",
            normalized, MAX_SYMBOL_LEN
        )));
    }
    let valid_start = normalized
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '^')
        .unwrap_or(false);
    if !valid_start {
        return Err(ForecastError::Config(format!(
            "symbol '{}' must start with a letter",
            normalized
        )));
    }
    if let Some(ch) = normalized
        .chars()
        .skip(1)
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
    {
        return Err(ForecastError::Config(format!(
            "symbol '{}' contains invalid character '{}'",
            normalized, ch
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_symbol(" brk-b ").unwrap(), "BRK-B");
        assert_eq!(normalize_symbol("^gspc").unwrap(), "^GSPC");
    }

    #[test]
    fn rejects_path_like_symbols() {
        assert!(normalize_symbol("../etc").is_err());
        assert!(normalize_symbol("A/B").is_err());
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("1AAPL").is_err());
    }
}
