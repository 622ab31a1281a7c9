// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com

use std::sync::OnceLock;

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use rand::{Rng, distr::Alphanumeric};
use regex::Regex;

use crate::consts::{TOKEN_ID_LENGTH, TOKEN_SECRET_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Web,
    Tcp,
}

impl TokenType {
    fn tag(&self) -> &'static str {
        match self {
            TokenType::Web => "w",
            TokenType::Tcp => "t",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "w" => Some(TokenType::Web),
            "t" => Some(TokenType::Tcp),
            _ => None,
        }
    }
}

/// Bearer credential handed out by the broker. The secret travels in clear
/// inside the encoded form and is only ever stored hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenType,
    pub id: String,
    pub secret: String,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-zA-Z0-9][a-zA-Z0-9-]{0,31}$").unwrap())
}

/// Whether `id` is acceptable as a caller supplied key id.
pub fn is_valid_id(id: &str) -> bool {
    id_pattern().is_match(id)
}

fn random_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_ID_LENGTH)
        .map(char::from)
        .collect()
}

fn random_secret() -> String {
    let mut secret = [0u8; TOKEN_SECRET_LENGTH];
    rand::rng().fill(&mut secret[..]);
    general_purpose::STANDARD.encode(secret)
}

impl Token {
    /// Create a token with a fresh random secret. A caller supplied id must
    /// match `[a-zA-Z0-9][a-zA-Z0-9-]{0,31}`; without one an 8 character
    /// alphanumeric id is generated.
    pub fn generate(kind: TokenType, id: Option<&str>) -> Result<Self> {
        let id = match id {
            Some(id) => {
                if !id_pattern().is_match(id) {
                    anyhow::bail!("invalid token id: {:?}", id);
                }
                id.to_string()
            }
            None => random_id(),
        };
        Ok(Token {
            kind,
            id,
            secret: random_secret(),
        })
    }

    /// Same token with a freshly generated random id. Used by the issuance
    /// retry loop on id collisions.
    pub fn with_fresh_id(&self) -> Self {
        Token {
            kind: self.kind,
            id: random_id(),
            secret: self.secret.clone(),
        }
    }

    /// Opaque wire form: `base64(<t|w>:<id>:<secret>)`.
    pub fn encode(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}:{}", self.kind.tag(), self.id, self.secret))
    }

    /// Decode the wire form. The legacy two part form `base64(<id>:<secret>)`
    /// is accepted and yields a web token, whatever the id looks like.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("invalid token encoding: {}", e))?;
        let raw = String::from_utf8(raw).map_err(|_| anyhow::anyhow!("token is not utf-8"))?;
        let parts: Vec<&str> = raw.splitn(3, ':').collect();
        match parts.as_slice() {
            [id, secret] => Ok(Token {
                kind: TokenType::Web,
                id: (*id).to_string(),
                secret: (*secret).to_string(),
            }),
            [tag, id, secret] => {
                let kind = TokenType::from_tag(tag)
                    .ok_or_else(|| anyhow::anyhow!("unknown token type tag: {:?}", tag))?;
                Ok(Token {
                    kind,
                    id: (*id).to_string(),
                    secret: (*secret).to_string(),
                })
            }
            _ => Err(anyhow::anyhow!("malformed token")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_web() {
        let token = Token::generate(TokenType::Web, None).unwrap();
        assert_eq!(token.id.len(), TOKEN_ID_LENGTH);
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_round_trip_tcp() {
        let token = Token::generate(TokenType::Tcp, Some("abc123")).unwrap();
        assert_eq!(token.id, "abc123");
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_encode_prefixes() {
        let web = Token {
            kind: TokenType::Web,
            id: "id1".to_string(),
            secret: "sec".to_string(),
        };
        let raw = general_purpose::STANDARD.decode(web.encode()).unwrap();
        assert_eq!(raw, b"w:id1:sec");

        let tcp = Token { kind: TokenType::Tcp, ..web };
        let raw = general_purpose::STANDARD.decode(tcp.encode()).unwrap();
        assert_eq!(raw, b"t:id1:sec");
    }

    #[test]
    fn test_legacy_two_part_decodes_as_web() {
        let encoded = general_purpose::STANDARD.encode("abc:def");
        let token = Token::decode(&encoded).unwrap();
        assert_eq!(token.kind, TokenType::Web);
        assert_eq!(token.id, "abc");
        assert_eq!(token.secret, "def");

        // A two part form starting with a type tag is still legacy
        let encoded = general_purpose::STANDARD.encode("t:def");
        let token = Token::decode(&encoded).unwrap();
        assert_eq!(token.kind, TokenType::Web);
        assert_eq!(token.id, "t");
    }

    #[test]
    fn test_decode_unknown_tag() {
        let encoded = general_purpose::STANDARD.encode("x:id:secret");
        assert!(Token::decode(&encoded).is_err());
    }

    #[test]
    fn test_generate_rejects_long_id() {
        let id = "a".repeat(72);
        assert!(Token::generate(TokenType::Web, Some(&id)).is_err());
    }

    #[test]
    fn test_generate_rejects_invalid_chars() {
        assert!(Token::generate(TokenType::Web, Some("INVALID_KEY!")).is_err());
    }

    #[test]
    fn test_generate_keeps_supplied_id() {
        let token = Token::generate(TokenType::Web, Some("abc123")).unwrap();
        assert_eq!(token.id, "abc123");
    }

    #[test]
    fn test_generate_rejects_leading_dash() {
        assert!(Token::generate(TokenType::Web, Some("-abc")).is_err());
    }

    #[test]
    fn test_fresh_id_keeps_secret() {
        let token = Token::generate(TokenType::Web, None).unwrap();
        let fresh = token.with_fresh_id();
        assert_ne!(fresh.id, token.id);
        assert_eq!(fresh.secret, token.secret);
    }
}
