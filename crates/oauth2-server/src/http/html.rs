//! Inline HTML template for the login page

use super::login::LoginPageQuery;

/// Login form posting to `/auth/login`; OAuth parameters ride along as hidden fields
pub fn login_page(query: &LoginPageQuery) -> String {
    let hidden = [
        ("client_id", query.client_id.as_deref()),
        ("redirect_uri", query.redirect_uri.as_deref()),
        ("state", query.state.as_deref()),
        ("response_type", Some(query.response_type.as_deref().unwrap_or("code"))),
    ]
    .into_iter()
    .filter_map(|(name, value)| {
        value.map(|v| {
            format!(
                r#"<input type="hidden" name="{}" value="{}">"#,
                name,
                html_escape(v)
            )
        })
    })
    .collect::<Vec<_>>()
    .join("\n            ");

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Sign in</title>
    <style>{}</style>
</head>
<body>
    <div class="container">
        <h1>Sign in</h1>
        <form method="post" action="/auth/login">
            {}
            <div class="field">
                <label for="username">Username</label>
                <input type="email" id="username" name="username" required autocomplete="username">
            </div>
            <div class="field">
                <label for="password">Password</label>
                <input type="password" id="password" name="password" required autocomplete="current-password">
            </div>
            <div class="field">
                <label for="country">Country</label>
                <input type="text" id="country" name="country" maxlength="2" placeholder="AR">
            </div>
            <button type="submit">Sign in</button>
        </form>
    </div>
</body>
</html>"#,
        CSS_STYLES, hidden
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

const CSS_STYLES: &str = r#"
* {
    box-sizing: border-box;
}
body {
    font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
    background: #f4f5f7;
    color: #222;
    margin: 0;
    padding: 20px;
    min-height: 100vh;
    display: flex;
    align-items: center;
    justify-content: center;
}
.container {
    background: #fff;
    padding: 32px;
    border-radius: 8px;
    max-width: 360px;
    width: 100%;
    box-shadow: 0 2px 12px rgba(0,0,0,0.08);
}
h1 {
    margin: 0 0 20px 0;
    font-size: 22px;
}
.field {
    margin-bottom: 16px;
}
label {
    display: block;
    margin-bottom: 6px;
    font-size: 14px;
}
input {
    width: 100%;
    padding: 10px;
    border: 1px solid #ccc;
    border-radius: 6px;
    font-size: 15px;
}
button {
    width: 100%;
    padding: 12px;
    background: #2f6fde;
    color: #fff;
    border: none;
    border-radius: 6px;
    font-size: 15px;
    cursor: pointer;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_fields_escaped() {
        let page = login_page(&LoginPageQuery {
            client_id: Some("client1".into()),
            redirect_uri: Some("https://example.org/cb".into()),
            state: Some("\"><script>".into()),
            response_type: None,
        });
        assert!(page.contains(r#"name="client_id" value="client1""#));
        assert!(page.contains(r#"name="response_type" value="code""#));
        assert!(page.contains("&quot;&gt;&lt;script&gt;"));
        assert!(!page.contains("\"><script>"));
    }
}
