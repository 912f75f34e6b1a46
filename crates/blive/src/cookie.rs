//! Cookie helpers for the Bilibili web APIs.

/// Extract a specific cookie value from a cookie string.
///
/// ```
/// use blive::cookie::extract_cookie_value;
///
/// let cookies = "SESSDATA=abc123; bili_jct=xyz789";
/// assert_eq!(extract_cookie_value(cookies, "SESSDATA"), Some("abc123".to_string()));
/// ```
pub fn extract_cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// CSRF token (`bili_jct`) required by write APIs.
pub fn csrf_token(cookies: &str) -> Option<String> {
    extract_cookie_value(cookies, "bili_jct").filter(|v| !v.is_empty())
}

/// Logged-in user id, or `None` for a guest session.
///
/// `DedeUserID` only counts when a `SESSDATA` session cookie is present too.
pub fn login_uid(cookies: &str) -> Option<u64> {
    extract_cookie_value(cookies, "SESSDATA").filter(|v| !v.is_empty())?;
    extract_cookie_value(cookies, "DedeUserID")?.parse().ok()
}

/// Generates a fake BUVID3 identifier.
///
/// Format: `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXinfoc`.
pub fn generate_fake_buvid3() -> String {
    let u = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!(
        "{}-{}-{}-{}-{}infoc",
        &u[0..8],
        &u[8..12],
        &u[12..16],
        &u[16..20],
        &u[20..]
    )
}

/// Cookie header for HTTP calls: the user's cookies, with a generated
/// `buvid3` appended when they don't carry one.
pub fn with_buvid3(cookies: Option<&str>) -> String {
    let cookies = cookies.map(str::trim).unwrap_or_default();
    if extract_cookie_value(cookies, "buvid3").is_some() {
        return cookies.to_string();
    }

    let buvid3 = format!("buvid3={}", generate_fake_buvid3());
    if cookies.is_empty() {
        buvid3
    } else {
        format!("{}; {buvid3}", cookies.trim_end_matches(';'))
    }
}
