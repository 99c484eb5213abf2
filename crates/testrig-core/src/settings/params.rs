//! Parser for `-name value` override strings.

use std::collections::BTreeMap;

use super::error::{SettingsError, SettingsResult};

/// Parse an override string such as `-url http://x -label "two words"`.
///
/// Values may be double-quoted to contain whitespace. A name with no
/// following value maps to an empty string.
pub fn parse_override_parameters(input: &str) -> SettingsResult<BTreeMap<String, String>> {
    let tokens = tokenize(input)?;
    let mut params = BTreeMap::new();
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        let name = match token.strip_prefix('-') {
            Some(name) if !token.quoted && !name.is_empty() => name.to_string(),
            _ => {
                return Err(SettingsError::Malformed(format!(
                    "expected -name in override parameters, found '{}'",
                    token.text
                )))
            }
        };
        let value = match iter.peek() {
            Some(next) if next.quoted || !next.looks_like_name() => {
                iter.next().map(|t| t.text).unwrap_or_default()
            }
            _ => String::new(),
        };
        params.insert(name, value);
    }
    Ok(params)
}

struct Token {
    text: String,
    quoted: bool,
}

impl Token {
    fn strip_prefix(&self, prefix: char) -> Option<&str> {
        self.text.strip_prefix(prefix)
    }

    /// `-name` but not a negative number such as `-1`.
    fn looks_like_name(&self) -> bool {
        self.text
            .strip_prefix('-')
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_alphabetic() || c == '_')
    }
}

fn tokenize(input: &str) -> SettingsResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                text.push(c);
            }
            if !closed {
                return Err(SettingsError::Malformed(
                    "unterminated quote in override parameters".into(),
                ));
            }
            tokens.push(Token { text, quoted: true });
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            tokens.push(Token {
                text,
                quoted: false,
            });
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pairs() {
        let params = parse_override_parameters("-url http://localhost:5000 -retries 3").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["url"], "http://localhost:5000");
        assert_eq!(params["retries"], "3");
    }

    #[test]
    fn test_parse_quoted_and_negative_values() {
        let params =
            parse_override_parameters(r#"-label "two words" -offset -1 -flag"#).unwrap();
        assert_eq!(params["label"], "two words");
        assert_eq!(params["offset"], "-1");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(parse_override_parameters("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bare_value_and_open_quote() {
        assert!(parse_override_parameters("value-without-name").is_err());
        assert!(parse_override_parameters(r#"-a "open"#).is_err());
    }
}
