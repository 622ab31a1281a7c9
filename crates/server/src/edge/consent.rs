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

// Anti-phishing gate: browsers get an interstitial consent form before their
// first proxied request, so a tunnel cannot silently impersonate a login
// page. Non-browser clients pass through untouched.

use std::collections::HashMap;

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    http::{RequestHead, read_body, write_response},
    templates,
};

pub const CONSENT_COOKIE: &str = "consent";
pub const CONSENT_VALUE: &str = "approved";
pub const CSRF_COOKIE: &str = "csrf_token";

pub enum Gate {
    ShowForm,
    HandlePost,
}

fn is_browser(user_agent: &str) -> bool {
    user_agent.starts_with("Mozilla/")
        || ["Chrome", "Safari", "Firefox", "Edg/", "OPR/", "Opera"]
            .iter()
            .any(|marker| user_agent.contains(marker))
}

/// Decide whether this request is intercepted by the gate. `None` lets it
/// through: unknown or empty user agents, and browsers that already carry
/// the consent cookie.
pub fn check(req: &RequestHead) -> Option<Gate> {
    if !is_browser(req.header("User-Agent").unwrap_or("")) {
        return None;
    }
    if req.cookie(CONSENT_COOKIE).as_deref() == Some(CONSENT_VALUE) {
        return None;
    }
    if req.method == "POST" {
        return Some(Gate::HandlePost);
    }
    Some(Gate::ShowForm)
}

pub async fn show_form<W>(stream: &mut W, req: &RequestHead) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut token_bytes = [0u8; 32];
    rand::rng().fill(&mut token_bytes[..]);
    let csrf_token = general_purpose::STANDARD.encode(token_bytes);

    let current_url = format!("{}{}", req.host().unwrap_or(""), req.path);
    let body = templates::consent_page(&req.path, &current_url, &csrf_token);

    write_response(
        stream,
        200,
        templates::HTML_CONTENT_TYPE,
        &[format!(
            "Set-Cookie: {}={}; HttpOnly; SameSite=Lax; Path=/",
            CSRF_COOKIE, csrf_token
        )],
        body.as_bytes(),
    )
    .await
}

fn parse_form(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Redirect targets must stay on this host: backslashes are normalised,
/// anything absolute or protocol-relative falls back to `/`.
pub fn sanitize_redirect(raw: &str) -> String {
    let cleaned = raw.replace('\\', "/");
    match url::Url::parse(&cleaned) {
        // Parses on its own means it carries a scheme, that is external
        Ok(_) => "/".to_string(),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if cleaned.starts_with("//") || !cleaned.starts_with('/') {
                "/".to_string()
            } else {
                cleaned
            }
        }
        Err(_) => "/".to_string(),
    }
}

pub async fn handle_post<S>(stream: &mut S, req: &RequestHead) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(body) = read_body(stream, req).await else {
        return invalid(stream).await;
    };
    let form = parse_form(&body);

    let cookie_token = req.cookie(CSRF_COOKIE);
    let form_token = form.get(CSRF_COOKIE);
    let token_matches = matches!((&cookie_token, form_token),
        (Some(cookie), Some(form)) if cookie == form && !cookie.is_empty());
    if !token_matches || form.get("consent").map(String::as_str) != Some("true") {
        return invalid(stream).await;
    }

    let target = sanitize_redirect(form.get("original_url").map(String::as_str).unwrap_or("/"));
    write_response(
        stream,
        303,
        templates::HTML_CONTENT_TYPE,
        &[
            format!("Location: {}", target),
            format!(
                "Set-Cookie: {}={}; HttpOnly; SameSite=None; Path=/; Max-Age=86400",
                CONSENT_COOKIE, CONSENT_VALUE
            ),
            format!("Set-Cookie: {}=; Path=/; Max-Age=0", CSRF_COOKIE),
        ],
        b"",
    )
    .await
}

async fn invalid<W>(stream: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response(
        stream,
        400,
        templates::HTML_CONTENT_TYPE,
        &[],
        templates::INVALID_REQUEST_TEXT.as_bytes(),
    )
    .await
}
