//! Tokenizer for the formula language.

use crate::FormulaError;

// ---

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    // ---
    Num(f64),
    Str(String),
    Ident(String),
    /// `%longitude%` style station constant.
    Placeholder(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub pos: usize,
}

/// Longest match first.
const PUNCTS: &[&str] = &[
    "===", "!==", "**", "=>", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<",
    ">", "!", "?", ":", "(", ")", "[", "]", "{", "}", ",", ";", ".", "=",
];

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
    // ---
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // comments
        if src[i..].starts_with("//") {
            i = src[i..].find('\n').map_or(bytes.len(), |n| i + n);
            continue;
        }
        if src[i..].starts_with("/*") {
            let end = src[i + 2..]
                .find("*/")
                .ok_or_else(|| FormulaError::parse(i, "unterminated comment"))?;
            i += end + 4;
            continue;
        }

        let start = i;

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            i = scan_number(bytes, i);
            let text = &src[start..i];
            let value = text
                .parse::<f64>()
                .map_err(|_| FormulaError::parse(start, format!("bad number '{text}'")))?;
            tokens.push(Token {
                tok: Tok::Num(value),
                pos: start,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(src[start..i].to_string()),
                pos: start,
            });
            continue;
        }

        if c == b'\'' || c == b'"' || c == b'`' {
            let (text, next) = scan_string(src, i)?;
            tokens.push(Token {
                tok: Tok::Str(text),
                pos: start,
            });
            i = next;
            continue;
        }

        if c == b'%' {
            if let Some((name, next)) = scan_placeholder(src, i) {
                tokens.push(Token {
                    tok: Tok::Placeholder(name),
                    pos: start,
                });
                i = next;
                continue;
            }
        }

        let punct = PUNCTS
            .iter()
            .find(|p| src[i..].starts_with(*p))
            .ok_or_else(|| {
                let ch = src[i..].chars().next().unwrap_or('?');
                FormulaError::parse(i, format!("unexpected character '{ch}'"))
            })?;
        tokens.push(Token {
            tok: Tok::Punct(punct),
            pos: start,
        });
        i += punct.len();
    }

    tokens.push(Token {
        tok: Tok::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    // ---
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

fn scan_string(src: &str, start: usize) -> Result<(String, usize), FormulaError> {
    // ---
    let mut chars = src[start..].char_indices();
    let (_, quote) = chars
        .next()
        .ok_or_else(|| FormulaError::parse(start, "expected string"))?;
    let mut out = String::new();

    while let Some((off, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, start + off + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            '$' if quote == '`' && src[start + off..].starts_with("${") => {
                return Err(FormulaError::parse(
                    start + off,
                    "template interpolation is not supported",
                ));
            }
            c => out.push(c),
        }
    }
    Err(FormulaError::parse(start, "unterminated string"))
}

/// `%name%` where name is a plain identifier; anything else is the modulo operator.
fn scan_placeholder(src: &str, start: usize) -> Option<(String, usize)> {
    // ---
    let rest = &src[start + 1..];
    let end = rest.find('%')?;
    let name = &rest[..end];
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| (name.to_string(), start + end + 2))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_tokenizes_arrow_formula() {
        // ---
        assert_eq!(
            toks("val = d => d['temperature:outTemp'] - 273.15"),
            vec![
                Tok::Ident("val".into()),
                Tok::Punct("="),
                Tok::Ident("d".into()),
                Tok::Punct("=>"),
                Tok::Ident("d".into()),
                Tok::Punct("["),
                Tok::Str("temperature:outTemp".into()),
                Tok::Punct("]"),
                Tok::Punct("-"),
                Tok::Num(273.15),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_placeholder_versus_modulo() {
        // ---
        assert_eq!(
            toks("%latitude% * 2"),
            vec![
                Tok::Placeholder("latitude".into()),
                Tok::Punct("*"),
                Tok::Num(2.0),
                Tok::Eof
            ]
        );
        assert_eq!(
            toks("a % b"),
            vec![
                Tok::Ident("a".into()),
                Tok::Punct("%"),
                Tok::Ident("b".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_comments_and_exponents() {
        // ---
        assert_eq!(
            toks("1e3 // thousand\n/* x */ 2.5E-1"),
            vec![Tok::Num(1000.0), Tok::Num(0.25), Tok::Eof]
        );
    }

    #[test]
    fn test_rejects_unknown_characters() {
        // ---
        let err = tokenize("a # b").unwrap_err();
        assert_eq!(
            err,
            FormulaError::Parse {
                position: 2,
                message: "unexpected character '#'".into()
            }
        );
        assert!(tokenize("'open").is_err());
    }
}
