//! Decoder for the lexer's serialized output (§6, `LexOut`).
//!
//! The lexer itself is an external collaborator and out of scope (§1);
//! what this module owns is turning the byte buffers it hands the CLI
//! into the in-memory `quillc_core::token::LexOut` the parser consumes.
//! spec.md fixes the *token* wire shape exactly (§3: one tag byte,
//! optional inline payload) but leaves the container that bundles the
//! token buffer with the two pools unspecified beyond naming its fields
//! (`tokens`, `string_pool`, `ident_pool`, `first_line`, plus their
//! lengths/counts). This module picks one concrete, self-describing
//! layout for that container — a sequence of VLQ-size-prefixed sections
//! in field order — so the CLI has something to read from a file or
//! stdin at all.
//!
//! Section layout (all sizes are VLQ-size, §4.1):
//! `first_line, string_pool_len, string_pool bytes, string_count,
//! ident_pool_len, ident_pool bytes, ident_count, tokens_len, tokens bytes`.
//! Pool bytes are the NUL-terminated entries concatenated, same shape
//! `quillc_core::token::Pool` already expects.
//!
//! Token tag bytes: `0=Newline, 1=End, 2=IntLiteral, 3=FloatLiteral,
//! 4=StringLiteral, 5=Identifier, 6=Symbol`, each immediately preceded by
//! a VLQ-size source line. `IntLiteral` carries an 8-byte little-endian
//! `i64`; `FloatLiteral` an 8-byte little-endian `f64`; `StringLiteral`/
//! `Identifier` a VLQ-size pool index; `Symbol` a VLQ-size length
//! followed by that many spelling bytes; `Newline`/`End` carry nothing.

use quillc_core::codec::decode_vlq_size;
use quillc_core::token::{LexOut, Pool, Token};

use crate::error::CompileError;

fn too_short(what: &str) -> CompileError {
    CompileError::internal(format!("lexer output truncated: expected {what}"))
}

fn take_vlq_size(input: &[u8], pos: &mut usize, what: &str) -> Result<u64, CompileError> {
    if *pos > input.len() {
        return Err(too_short(what));
    }
    let (v, used) = decode_vlq_size(&input[*pos..]);
    if used == 0 {
        return Err(too_short(what));
    }
    *pos += used;
    Ok(v)
}

fn take_bytes<'a>(input: &'a [u8], pos: &mut usize, len: usize, what: &str) -> Result<&'a [u8], CompileError> {
    let end = pos.checked_add(len).ok_or_else(|| too_short(what))?;
    if end > input.len() {
        return Err(too_short(what));
    }
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

fn split_nul_terminated(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty() || bytes.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn decode_pool(input: &[u8], pos: &mut usize, len_what: &str, bytes_what: &str) -> Result<Pool, CompileError> {
    let len = take_vlq_size(input, pos, len_what)? as usize;
    let bytes = take_bytes(input, pos, len, bytes_what)?;
    let entries = if bytes.is_empty() { Vec::new() } else { split_nul_terminated(bytes) };
    Ok(Pool::new(entries))
}

fn decode_token(input: &[u8], pos: &mut usize) -> Result<Token, CompileError> {
    let line = take_vlq_size(input, pos, "token source line")? as u32;
    let tag = *take_bytes(input, pos, 1, "token tag")?.first().unwrap();
    match tag {
        0 => Ok(Token::newline(line)),
        1 => Ok(Token::end(line)),
        2 => {
            let raw = take_bytes(input, pos, 8, "int literal payload")?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            Ok(Token::int_literal(i64::from_le_bytes(buf), line))
        }
        3 => {
            let raw = take_bytes(input, pos, 8, "float literal payload")?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            Ok(Token::float_literal(f64::from_le_bytes(buf), line))
        }
        4 => {
            let idx = take_vlq_size(input, pos, "string literal pool index")? as u32;
            Ok(Token::string_literal(idx, line))
        }
        5 => {
            let idx = take_vlq_size(input, pos, "identifier pool index")? as u32;
            Ok(Token::identifier(idx, line))
        }
        6 => {
            let len = take_vlq_size(input, pos, "symbol spelling length")? as usize;
            let spelling = take_bytes(input, pos, len, "symbol spelling bytes")?;
            let text = String::from_utf8_lossy(spelling).into_owned();
            Ok(Token::symbol(text, line))
        }
        other => Err(CompileError::internal(format!("unrecognized token tag byte {other:#04x}"))),
    }
}

/// Decode a lexer output buffer into the in-memory `LexOut` the parser
/// walks. Returns an error rather than panicking on truncated or
/// malformed input — this is a trust boundary, the one place in the
/// pipeline reading bytes that didn't come from this compiler itself.
pub fn decode(input: &[u8]) -> Result<LexOut, CompileError> {
    let mut pos = 0usize;
    let first_line = take_vlq_size(input, &mut pos, "first line")? as u32;
    let string_pool = decode_pool(input, &mut pos, "string pool length", "string pool bytes")?;
    let _string_count = take_vlq_size(input, &mut pos, "string pool entry count")?;
    let ident_pool = decode_pool(input, &mut pos, "identifier pool length", "identifier pool bytes")?;
    let _ident_count = take_vlq_size(input, &mut pos, "identifier pool entry count")?;

    let tokens_len = take_vlq_size(input, &mut pos, "token stream length")? as usize;
    let tokens_end = pos.checked_add(tokens_len).ok_or_else(|| too_short("token stream bytes"))?;
    if tokens_end > input.len() {
        return Err(too_short("token stream bytes"));
    }
    let mut tokens = Vec::new();
    while pos < tokens_end {
        tokens.push(decode_token(input, &mut pos)?);
    }
    if pos != tokens_end {
        return Err(CompileError::internal("token stream section length mismatch"));
    }

    Ok(LexOut { tokens, string_pool, ident_pool, first_line })
}

/// Encode a `LexOut` back into the wire format [`decode`] reads, the
/// inverse used by tests and by anything producing fixtures for the CLI.
pub fn encode(lex: &LexOut) -> Vec<u8> {
    use quillc_core::codec::encode_vlq_size;

    let mut out = Vec::new();
    encode_vlq_size(lex.first_line as u64, &mut out);

    let mut string_bytes = Vec::new();
    for entry in &lex.string_pool.entries {
        string_bytes.extend_from_slice(entry.as_bytes());
        string_bytes.push(0);
    }
    encode_vlq_size(string_bytes.len() as u64, &mut out);
    out.extend_from_slice(&string_bytes);
    encode_vlq_size(lex.string_pool.entries.len() as u64, &mut out);

    let mut ident_bytes = Vec::new();
    for entry in &lex.ident_pool.entries {
        ident_bytes.extend_from_slice(entry.as_bytes());
        ident_bytes.push(0);
    }
    encode_vlq_size(ident_bytes.len() as u64, &mut out);
    out.extend_from_slice(&ident_bytes);
    encode_vlq_size(lex.ident_pool.entries.len() as u64, &mut out);

    let mut token_bytes = Vec::new();
    for tok in &lex.tokens {
        encode_vlq_size(tok.line as u64, &mut token_bytes);
        use quillc_core::token::TokenTag;
        match tok.tag {
            TokenTag::Newline => token_bytes.push(0),
            TokenTag::End => token_bytes.push(1),
            TokenTag::IntLiteral => {
                token_bytes.push(2);
                token_bytes.extend_from_slice(&tok.int_value.to_le_bytes());
            }
            TokenTag::FloatLiteral => {
                token_bytes.push(3);
                token_bytes.extend_from_slice(&tok.float_value.to_le_bytes());
            }
            TokenTag::StringLiteral => {
                token_bytes.push(4);
                encode_vlq_size(tok.pool_index as u64, &mut token_bytes);
            }
            TokenTag::Identifier => {
                token_bytes.push(5);
                encode_vlq_size(tok.pool_index as u64, &mut token_bytes);
            }
            TokenTag::Symbol => {
                token_bytes.push(6);
                encode_vlq_size(tok.text.len() as u64, &mut token_bytes);
                token_bytes.extend_from_slice(tok.text.as_bytes());
            }
        }
    }
    encode_vlq_size(token_bytes.len() as u64, &mut out);
    out.extend_from_slice(&token_bytes);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillc_core::token::Pool;

    fn sample() -> LexOut {
        LexOut {
            tokens: vec![
                Token::identifier(0, 1),
                Token::symbol("=", 1),
                Token::int_literal(42, 1),
                Token::newline(1),
                Token::end(2),
            ],
            string_pool: Pool::new(vec!["hello".into()]),
            ident_pool: Pool::new(vec!["x".into()]),
            first_line: 1,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let lex = sample();
        let bytes = encode(&lex);
        let decoded = decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded.first_line, lex.first_line);
        assert_eq!(decoded.tokens.len(), lex.tokens.len());
        assert_eq!(decoded.string_pool.entries, lex.string_pool.entries);
        assert_eq!(decoded.ident_pool.entries, lex.ident_pool.entries);
        assert_eq!(decoded.tokens[2].int_value, 42);
        assert_eq!(decoded.tokens[1].text, "=");
    }

    #[test]
    fn truncated_input_is_an_error_not_a_panic() {
        let bytes = encode(&sample());
        let truncated = &bytes[..bytes.len() - 3];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn unrecognized_tag_byte_is_rejected() {
        let mut bytes = Vec::new();
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // first_line
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // string pool len
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // string count
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // ident pool len
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // ident count
        quillc_core::codec::encode_vlq_size(2, &mut bytes); // tokens_len
        quillc_core::codec::encode_vlq_size(0, &mut bytes); // token line
        bytes.push(0xEE); // bogus tag
        assert!(decode(&bytes).is_err());
    }
}
