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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use subtle::ConstantTimeEq;

use shared::{
    errors::CoreError,
    log,
    token::{Token, TokenType},
};

use crate::consts::{
    DIGEST_SCHEME_PREFIX, SCRYPT_DIGEST_LEN, SCRYPT_LOG_N, SCRYPT_P, SCRYPT_R, TOKEN_SAVE_RETRIES,
};

mod storage;

pub use storage::{KvStorage, MemoryStorage, RedisStorage};

/// Key records live in the KV store as `<prefix><key_id> -> scrypt digest`,
/// expiring with the token ttl. Secrets never touch the store in clear.
pub struct AuthRepo {
    storage: Arc<dyn KvStorage>,
    salt: String,
    key_prefix: String,
}

impl AuthRepo {
    pub fn new(storage: Arc<dyn KvStorage>, salt: &str, key_prefix: &str) -> Self {
        AuthRepo {
            storage,
            salt: salt.to_string(),
            key_prefix: key_prefix.to_string(),
        }
    }

    fn storage_key(&self, key_id: &str) -> String {
        format!("{}{}", self.key_prefix, key_id)
    }

    fn hash_secret(&self, secret: &str) -> Result<String> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_DIGEST_LEN)
            .map_err(|e| anyhow::anyhow!("invalid scrypt parameters: {}", e))?;
        let mut digest = [0u8; SCRYPT_DIGEST_LEN];
        scrypt::scrypt(secret.as_bytes(), self.salt.as_bytes(), &params, &mut digest)
            .map_err(|e| anyhow::anyhow!("scrypt failed: {}", e))?;
        Ok(format!(
            "{}{}",
            DIGEST_SCHEME_PREFIX,
            general_purpose::STANDARD.encode(digest)
        ))
    }

    /// True iff a record for `key_id` exists and its digest matches. A
    /// missing key or a wrong secret is a plain `false`; only transport
    /// failures surface as errors.
    pub async fn verify(&self, key_id: &str, secret: &str) -> Result<bool> {
        let Some(stored) = self.storage.get(&self.storage_key(key_id)).await? else {
            return Ok(false);
        };
        let computed = self.hash_secret(secret)?;
        Ok(computed.as_bytes().ct_eq(stored.as_bytes()).into())
    }

    pub async fn is_key_exists(&self, key_id: &str) -> Result<bool> {
        self.storage.exists(&self.storage_key(key_id)).await
    }

    pub async fn save_token(&self, token: &Token, ttl: Duration) -> Result<()> {
        let digest = self.hash_secret(&token.secret)?;
        if !self
            .storage
            .set_nx(&self.storage_key(&token.id), &digest, ttl)
            .await?
        {
            return Err(CoreError::DuplicateTokenId.into());
        }
        Ok(())
    }

    /// Deleting an absent key is not an error: the management API promises
    /// an idempotent 204 either way. The miss is only worth a log line.
    pub async fn delete_token(&self, key_id: &str) -> Result<()> {
        if !self.storage.delete(&self.storage_key(key_id)).await? {
            log::debug!("delete for unknown key {}: {}", key_id, CoreError::TokenNotFound);
        }
        Ok(())
    }

    /// Issue a fresh token and persist its digest. On id collisions the id is
    /// regenerated, up to 3 attempts in total, but only when the caller
    /// supplied none. The clear text secret is returned exactly once.
    pub async fn issue(
        &self,
        kind: TokenType,
        key_id: Option<&str>,
        ttl: Duration,
    ) -> Result<Token> {
        if ttl.is_zero() {
            anyhow::bail!("token ttl must be positive");
        }
        let mut token = Token::generate(kind, key_id)?;
        let mut attempts = 0;
        loop {
            match self.save_token(&token, ttl).await {
                Ok(()) => return Ok(token),
                Err(e) if e.downcast_ref::<CoreError>() == Some(&CoreError::DuplicateTokenId) => {
                    if key_id.is_some() {
                        return Err(e);
                    }
                    attempts += 1;
                    if attempts >= TOKEN_SAVE_RETRIES {
                        return Err(CoreError::FailedToGenerateUniqueToken.into());
                    }
                    token = token.with_fresh_id();
                }
                Err(e) => return Err(e),
            }
        }
    }
}
