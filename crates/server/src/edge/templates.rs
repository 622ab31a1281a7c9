pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

pub const NOT_FOUND_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
<h1>404 Not Found</h1>
<p>There is no service published under this name.</p>
</body>
</html>
"#;

pub const BAD_GATEWAY_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>502 Bad Gateway</title></head>
<body>
<h1>502 Bad Gateway</h1>
<p>The service behind this name did not answer.</p>
</body>
</html>
"#;

pub const TOO_MANY_REQUESTS_TEXT: &str = "Too many requests";

pub const INVALID_REQUEST_TEXT: &str = "Invalid request";

pub fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// The interstitial shown to browsers before the first proxied request.
pub fn consent_page(original_url: &str, current_url: &str, csrf_token: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Consent Required</title></head>
<body>
<h1>Consent Required</h1>
<p>You are about to visit <b>{current}</b>, a tunnel to a privately hosted
service. If you were asked to enter credentials here by a third party, close
this page.</p>
<form method="POST" action="{original}">
  <input type="hidden" name="consent" value="true">
  <input type="hidden" name="csrf_token" value="{token}">
  <input type="hidden" name="original_url" value="{original}">
  <button type="submit">Continue</button>
</form>
</body>
</html>
"#,
        current = html_escape(current_url),
        original = html_escape(original_url),
        token = html_escape(csrf_token),
    )
}
