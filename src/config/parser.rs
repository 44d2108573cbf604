//! Chain description tokenizer and parser
//!
//! Each non-comment line of a chain description names one proxy chain:
//! hop specifications separated by `|`, each a protocol, an address,
//! and positional args. `set`/`unset`/`clear` segments are directives
//! that mutate the kwargs dictionary inherited by the hops that follow
//! them on the line.

use crate::error::{Result, SockchainError};
use crate::proxy::{Chain, Kwargs, ProxyInfo};

/// Split a line into fields.
///
/// `|` is always its own field. Whitespace separates fields. A single
/// or double quote starts a quoted field with backslash escapes; the
/// closing quote must appear before the end of the line.
pub fn split_fields(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut pos = 0;

    while pos < line.len() {
        let c = line[pos..].chars().next().expect("in-bounds char");
        match c {
            '|' => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
                fields.push("|".to_string());
                pos += 1;
            }
            ' ' | '\t' | '\r' | '\n' | '\x0b' | '\x0c' => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
                pos += 1;
            }
            '"' | '\'' => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
                let (unquoted, used) = read_quoted(&line[pos..])?;
                fields.push(unquoted);
                pos += used;
            }
            other => {
                current.push(other);
                pos += other.len_utf8();
            }
        }
    }

    if !current.is_empty() {
        fields.push(current);
    }

    Ok(fields)
}

/// Read a quoted field from the front of `s` (which starts at the
/// opening quote). Returns the unescaped content and the number of
/// bytes consumed including both quotes.
fn read_quoted(s: &str) -> Result<(String, usize)> {
    let quote = s.chars().next().expect("quoted field starts with quote");
    let mut out = String::new();
    let mut pos = quote.len_utf8();

    while pos < s.len() {
        let c = s[pos..].chars().next().expect("in-bounds char");
        if c == '\\' {
            pos += 1;
            let next = s[pos..].chars().next().ok_or_else(|| {
                SockchainError::Config(format!("string `{s}` ended with \\"))
            })?;
            out.push(match next {
                'a' => '\x07',
                'b' => '\x08',
                't' => '\t',
                'n' => '\n',
                'f' => '\x0c',
                'r' => '\r',
                'v' => '\x0b',
                other => other,
            });
            pos += next.len_utf8();
        } else if c == quote {
            return Ok((out, pos + 1));
        } else {
            out.push(c);
            pos += c.len_utf8();
        }
    }

    Err(SockchainError::Config(format!("unterminated string `{s}`")))
}

/// Assemble a chain from the fields of one line.
///
/// `defaults` is the process-wide kwargs dictionary: it seeds the
/// line's working kwargs and is overwritten when the line consists of
/// directives only.
pub fn parse_chain(fields: &[String], defaults: &mut Kwargs) -> Result<Chain> {
    let mut segments: Vec<Vec<String>> = Vec::new();
    let mut current = Vec::new();
    for field in fields {
        if field == "|" {
            segments.push(std::mem::take(&mut current));
        } else {
            current.push(field.clone());
        }
    }
    segments.push(current);

    let mut hops = Vec::new();
    let mut kwargs = defaults.clone();

    for segment in &segments {
        let info = match segment.len() {
            0 => {
                return Err(SockchainError::Config(
                    "found invalid proxy chain".to_string(),
                ))
            }
            1 => ProxyInfo {
                protocol: segment[0].clone(),
                address: String::new(),
                args: Vec::new(),
                kwargs: kwargs.clone(),
            },
            2 => ProxyInfo {
                protocol: segment[0].clone(),
                address: segment[1].clone(),
                args: Vec::new(),
                kwargs: kwargs.clone(),
            },
            _ => ProxyInfo {
                protocol: segment[0].clone(),
                address: segment[1].clone(),
                args: segment[2..].to_vec(),
                kwargs: kwargs.clone(),
            },
        };

        if info.is_directive() {
            kwargs = apply_directive(&info, &kwargs)?;
            continue;
        }

        if segment.len() < 2 {
            return Err(SockchainError::Config(
                "found invalid proxy chain".to_string(),
            ));
        }

        hops.push(info);
    }

    // a line of nothing but directives updates the process defaults
    if hops.is_empty() {
        *defaults = kwargs;
    }

    Ok(Chain::new(hops))
}

/// Apply one `set`/`unset`/`clear` directive to a copy of `working`.
fn apply_directive(info: &ProxyInfo, working: &Kwargs) -> Result<Kwargs> {
    let mut result = working.clone();
    match info.protocol.as_str() {
        "set" => {
            if info.args.len() != 1 {
                return Err(SockchainError::Config(format!(
                    "expected `set key value`, got `set {}`",
                    info.address
                )));
            }
            result.insert(info.address.clone(), info.args[0].clone());
        }
        "unset" => {
            result.remove(&info.address);
        }
        "clear" => {
            result.clear();
        }
        other => {
            return Err(SockchainError::Config(format!(
                "unknown directive `{other}`"
            )))
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(line: &str) -> Vec<String> {
        split_fields(line).unwrap()
    }

    #[test]
    fn test_split_plain_fields() {
        assert_eq!(fields("socks5 10.0.0.1:1080"), vec!["socks5", "10.0.0.1:1080"]);
        assert_eq!(fields("  a \t b  "), vec!["a", "b"]);
        assert!(fields("").is_empty());
        assert!(fields("   \t ").is_empty());
    }

    #[test]
    fn test_split_pipe_is_its_own_field() {
        assert_eq!(fields("a | b"), vec!["a", "|", "b"]);
        assert_eq!(fields("a|b"), vec!["a", "|", "b"]);
        assert_eq!(fields("||"), vec!["|", "|"]);
    }

    #[test]
    fn test_split_quoted_fields() {
        assert_eq!(fields(r#"a "b c" d"#), vec!["a", "b c", "d"]);
        assert_eq!(fields("'x y'"), vec!["x y"]);
        // a quote terminates the current field and starts a new one
        assert_eq!(fields(r#"ab"cd"ef"#), vec!["ab", "cd", "ef"]);
        // the other quote kind is literal inside a quoted field
        assert_eq!(fields(r#""it's""#), vec!["it's"]);
        assert_eq!(fields(r#""""#), vec![""]);
    }

    #[test]
    fn test_split_quoted_escapes() {
        assert_eq!(fields(r#""a\tb""#), vec!["a\tb"]);
        assert_eq!(fields(r#""a\nb""#), vec!["a\nb"]);
        assert_eq!(fields(r#""\a\b\f\r\v""#), vec!["\x07\x08\x0c\r\x0b"]);
        // escaping any other character yields it verbatim
        assert_eq!(fields(r#""\"id\"""#), vec![r#""id""#]);
        assert_eq!(fields(r#""a\\b""#), vec![r"a\b"]);
    }

    #[test]
    fn test_split_unterminated_string() {
        let err = split_fields(r#"socks5 "oops"#).unwrap_err();
        assert!(format!("{err}").contains("unterminated string"));
    }

    #[test]
    fn test_split_trailing_backslash() {
        let err = split_fields(r#"socks5 "oops\"#).unwrap_err();
        assert!(format!("{err}").contains("ended with"));
    }

    #[test]
    fn test_parse_single_hop() {
        let mut defaults = Kwargs::new();
        let chain = parse_chain(&fields("socks5 127.0.0.1:1080"), &mut defaults).unwrap();
        assert_eq!(chain.len(), 1);
        let hop = &chain.hops()[0];
        assert_eq!(hop.protocol, "socks5");
        assert_eq!(hop.address, "127.0.0.1:1080");
        assert!(hop.args.is_empty());
        assert!(hop.kwargs.is_empty());
    }

    #[test]
    fn test_parse_multi_hop_with_args() {
        let mut defaults = Kwargs::new();
        let chain = parse_chain(
            &fields("socks4a proxy.a:1080 | socks5 10.0.0.2:1080 user pass"),
            &mut defaults,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.hops()[0].protocol, "socks4a");
        assert_eq!(chain.hops()[1].args, vec!["user", "pass"]);
    }

    #[test]
    fn test_parse_quoted_arg_keeps_escapes() {
        let mut defaults = Kwargs::new();
        let chain = parse_chain(&fields(r#"socks4 p:1 "\"id\"""#), &mut defaults).unwrap();
        assert_eq!(chain.hops()[0].args, vec![r#""id""#]);
    }

    #[test]
    fn test_directive_only_line_promotes_defaults() {
        let mut defaults = Kwargs::new();
        let chain = parse_chain(&fields("set ConnTimeout 2s"), &mut defaults).unwrap();
        assert!(chain.is_empty());
        assert_eq!(defaults.get("ConnTimeout").map(String::as_str), Some("2s"));
    }

    #[test]
    fn test_defaults_seed_later_lines() {
        let mut defaults = Kwargs::new();
        parse_chain(&fields("set ConnTimeout 2s"), &mut defaults).unwrap();
        let chain = parse_chain(&fields("socks5 a:1"), &mut defaults).unwrap();
        assert_eq!(
            chain.hops()[0].kwargs.get("ConnTimeout").map(String::as_str),
            Some("2s")
        );
    }

    #[test]
    fn test_inline_directives_affect_following_hops_only() {
        let mut defaults = Kwargs::new();
        let chain = parse_chain(
            &fields("socks5 a:1 | set Key v | socks5 b:2"),
            &mut defaults,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain.hops()[0].kwargs.get("Key").is_none());
        assert_eq!(chain.hops()[1].kwargs.get("Key").map(String::as_str), Some("v"));
        // a line that produced hops does not touch the defaults
        assert!(defaults.is_empty());
    }

    #[test]
    fn test_unset_and_clear() {
        let mut defaults = Kwargs::new();
        parse_chain(&fields("set A 1 | set B 2"), &mut defaults).unwrap();
        assert_eq!(defaults.len(), 2);

        parse_chain(&fields("unset A"), &mut defaults).unwrap();
        assert!(defaults.get("A").is_none());
        assert!(defaults.get("B").is_some());

        parse_chain(&fields("clear"), &mut defaults).unwrap();
        assert!(defaults.is_empty());
    }

    #[test]
    fn test_set_arity_errors() {
        let mut defaults = Kwargs::new();
        assert!(parse_chain(&fields("set Key"), &mut defaults).is_err());
        assert!(parse_chain(&fields("set Key a b"), &mut defaults).is_err());
    }

    #[test]
    fn test_empty_segment_is_invalid() {
        let mut defaults = Kwargs::new();
        assert!(parse_chain(&fields("socks5 a:1 |"), &mut defaults).is_err());
        assert!(parse_chain(&fields("| socks5 a:1"), &mut defaults).is_err());
    }

    #[test]
    fn test_hop_without_address_is_invalid() {
        let mut defaults = Kwargs::new();
        assert!(parse_chain(&fields("socks5"), &mut defaults).is_err());
    }
}
