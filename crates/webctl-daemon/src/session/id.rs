//! Session id generation and extraction from cookies and URLs.

use rand::RngExt;

/// Name of the session token, in cookies and in the query string.
pub const SESSION_TOKEN: &str = "wtd";

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate an unpredictable alphanumeric session id.
///
/// Draws from the thread-local CSPRNG, which is seeded from the OS and
/// periodically reseeded.
pub fn generate_session_id(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Whether `id` has the expected shape of a session id.
pub fn is_valid_session_id(id: &str, length: usize) -> bool {
    id.len() == length && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Cookie name scoped to an entry point.
///
/// `/app` maps to `wtd_app`; the root entry point uses the bare `wtd` name.
pub fn session_cookie_name(script_name: &str) -> String {
    let scope: String = script_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let scope = scope.trim_matches('_');
    if scope.is_empty() {
        SESSION_TOKEN.to_string()
    } else {
        format!("{SESSION_TOKEN}_{scope}")
    }
}

/// Extract the session id from a `Cookie` header.
///
/// Looks for the cookie scoped to `script_name` first, then the generic
/// `wtd` cookie. The first cookie present decides: its value is returned if
/// it is exactly `session_id_length` alphanumeric characters, otherwise the
/// result is empty.
pub fn session_from_cookie(cookies: &str, script_name: &str, session_id_length: usize) -> String {
    if cookies.is_empty() {
        return String::new();
    }

    let scoped = session_cookie_name(script_name);
    let names = [scoped.as_str(), SESSION_TOKEN];

    for name in names {
        if let Some(value) = cookie_value(cookies, name) {
            return if is_valid_session_id(value, session_id_length) {
                value.to_string()
            } else {
                String::new()
            };
        }
    }
    String::new()
}

/// Extract the session id from the `wtd` query parameter.
pub fn session_from_query(query: &str, session_id_length: usize) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == SESSION_TOKEN)
        .map(|(_, value)| value)
        .filter(|value| is_valid_session_id(value, session_id_length))
        .map(String::from)
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(n, _)| n.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"'))
}
