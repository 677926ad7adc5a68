//! Template tokenizer.
//!
//! Splits source into text runs, echo expressions and directive tokens.
//! Directive names end at a word boundary (`@if` never matches inside
//! `@ifSomethingElse` — an unknown name stays literal text) and `@@`
//! escapes the marker. Comments (`{{-- --}}` and `{# #}`) are stripped
//! here; `@original ... @endoriginal` blocks pass through verbatim.

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    /// `{{ expr }}` — HTML-escaped at render time.
    EchoEscaped(String),
    /// `{!! expr !!}` — emitted raw.
    EchoRaw(String),
    Directive { name: String, args: String },
}

const DIRECTIVES: &[&str] = &[
    "if",
    "elseif",
    "else",
    "endif",
    "for",
    "endfor",
    "foreach",
    "endforeach",
    "isset",
    "endisset",
    "empty",
    "endempty",
    "section",
    "endsection",
    "auth",
    "endauth",
    "guest",
    "endguest",
    "error",
    "enderror",
    "original",
    "endoriginal",
    "extend",
    "include",
    "content",
    "continue",
    "break",
    "csrf",
    "method",
];

pub fn tokenize(source: &str) -> ServerResult<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &source[i..];

        if rest.starts_with("{{--") {
            let end = rest.find("--}}").ok_or_else(|| unterminated("{{--"))?;
            i += end + 4;
            continue;
        }
        if rest.starts_with("{#") {
            let end = rest.find("#}").ok_or_else(|| unterminated("{#"))?;
            i += end + 2;
            continue;
        }
        if rest.starts_with("{!!") {
            let end = rest[3..].find("!!}").ok_or_else(|| unterminated("{!!"))?;
            flush(&mut tokens, &mut text);
            tokens.push(Token::EchoRaw(rest[3..3 + end].trim().to_string()));
            i += end + 6;
            continue;
        }
        if rest.starts_with("{{") {
            let end = rest[2..].find("}}").ok_or_else(|| unterminated("{{"))?;
            flush(&mut tokens, &mut text);
            tokens.push(Token::EchoEscaped(rest[2..2 + end].trim().to_string()));
            i += end + 4;
            continue;
        }
        if rest.starts_with("@@") {
            // Escaped marker: `@@if` stays a literal `@if`.
            text.push('@');
            i += 2;
            continue;
        }
        if rest.starts_with('@') {
            let name: String = rest[1..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() && DIRECTIVES.contains(&name.as_str()) {
                flush(&mut tokens, &mut text);
                i += 1 + name.len();

                if name == "original" {
                    // Verbatim block: everything up to the closer is text.
                    let rest = &source[i..];
                    let end = rest
                        .find("@endoriginal")
                        .ok_or_else(|| unterminated("@original"))?;
                    tokens.push(Token::Directive {
                        name,
                        args: String::new(),
                    });
                    tokens.push(Token::Text(rest[..end].to_string()));
                    tokens.push(Token::Directive {
                        name: "endoriginal".to_string(),
                        args: String::new(),
                    });
                    i += end + "@endoriginal".len();
                    continue;
                }

                let args = if source[i..].starts_with('(') {
                    let (args, consumed) = read_parenthesized(&source[i..])?;
                    i += consumed;
                    args
                } else {
                    String::new()
                };
                tokens.push(Token::Directive { name, args });
                continue;
            }
            // Unknown word after `@`: not a directive, keep it literal.
            text.push('@');
            i += 1;
            continue;
        }

        let ch = rest.chars().next().expect("non-empty rest");
        text.push(ch);
        i += ch.len_utf8();
    }

    flush(&mut tokens, &mut text);
    Ok(tokens)
}

/// Read a balanced `(...)` group, honoring string quotes. Returns the inner
/// source and the bytes consumed including both parens.
fn read_parenthesized(source: &str) -> ServerResult<(String, usize)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, ch) in source.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((source[1..offset].trim().to_string(), offset + 1));
                    }
                }
                _ => {}
            },
        }
    }
    Err(ServerError::Template(
        "unbalanced parentheses in directive arguments".to_string(),
    ))
}

fn flush(tokens: &mut Vec<Token>, text: &mut String) {
    if !text.is_empty() {
        tokens.push(Token::Text(std::mem::take(text)));
    }
}

fn unterminated(opener: &str) -> ServerError {
    ServerError::Template(format!("unterminated '{}' block", opener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_echoes() {
        let tokens = tokenize("a {{ $x }} b {!! $y !!} c").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Text("a ".to_string()),
                Token::EchoEscaped("$x".to_string()),
                Token::Text(" b ".to_string()),
                Token::EchoRaw("$y".to_string()),
                Token::Text(" c".to_string()),
            ]
        );
    }

    #[test]
    fn both_comment_forms_are_stripped() {
        let tokens = tokenize("a{{-- gone --}}b{# also gone #}c").unwrap();
        assert_eq!(
            tokens,
            vec![Token::Text("a".to_string()), Token::Text("b".to_string()), Token::Text("c".to_string())]
        );
    }

    #[test]
    fn directives_with_and_without_args() {
        let tokens = tokenize("@if($x > 1)yes@endif").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Directive {
                    name: "if".to_string(),
                    args: "$x > 1".to_string()
                },
                Token::Text("yes".to_string()),
                Token::Directive {
                    name: "endif".to_string(),
                    args: String::new()
                },
            ]
        );
    }

    #[test]
    fn nested_parens_and_quotes_in_args() {
        let tokens = tokenize("@if(($a) == ')')x@endif").unwrap();
        assert_eq!(
            tokens[0],
            Token::Directive {
                name: "if".to_string(),
                args: "($a) == ')'".to_string()
            }
        );
    }

    #[test]
    fn unknown_directive_names_stay_literal() {
        let tokens = tokenize("@ifSomethingElse(1)").unwrap();
        assert_eq!(tokens, vec![Token::Text("@ifSomethingElse(1)".to_string())]);
    }

    #[test]
    fn escaped_marker_stays_literal() {
        let tokens = tokenize("@@if(true)").unwrap();
        assert_eq!(tokens, vec![Token::Text("@if(true)".to_string())]);
    }

    #[test]
    fn original_blocks_pass_through_verbatim() {
        let tokens = tokenize("@original{{ $x }} @if(1)@endoriginal").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Directive {
                    name: "original".to_string(),
                    args: String::new()
                },
                Token::Text("{{ $x }} @if(1)".to_string()),
                Token::Directive {
                    name: "endoriginal".to_string(),
                    args: String::new()
                },
            ]
        );
    }

    #[test]
    fn unterminated_echo_is_an_error() {
        assert!(tokenize("{{ $x").is_err());
        assert!(tokenize("{{-- comment").is_err());
    }
}
