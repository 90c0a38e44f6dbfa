//! HTML pages served by the front controller
//!
//! Pages are small enough to render with `format!`. Every interpolated value
//! goes through [`escape`].

use crate::process::{AppState, AppStatus};

/// Seconds before the placeholder page reloads itself
pub const PLACEHOLDER_REFRESH_SECS: u32 = 1;

const STYLE: &str = r##"
body { font-family: system-ui, sans-serif; max-width: 44rem; margin: 3rem auto; padding: 0 1rem; color: #1f2933; }
h1 { font-size: 1.6rem; }
ul.apps { list-style: none; padding: 0; }
ul.apps li { display: flex; align-items: center; gap: 1rem; padding: .75rem 0; border-bottom: 1px solid #e4e7eb; }
ul.apps a { font-weight: 600; }
.state { font-size: .8rem; padding: .1rem .5rem; border-radius: .75rem; background: #e4e7eb; }
.state.ready { background: #c6f7e2; }
.state.starting { background: #fff3c4; }
.state.crashed { background: #ffe3e3; }
.message { padding: .75rem 1rem; background: #e6f6ff; border-radius: .25rem; }
form { display: inline; }
"##;

/// Escape text for inclusion in HTML content or attribute values
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    {head_extra}
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
{body}
</body>
</html>
"##,
        title = escape(title),
        head_extra = head_extra,
        body = body,
    )
}

fn state_label(state: AppState) -> (&'static str, &'static str) {
    match state {
        AppState::NotStarted => ("stopped", "not started"),
        AppState::Starting => ("starting", "starting"),
        AppState::Ready => ("ready", "running"),
        AppState::Crashed => ("crashed", "exited"),
    }
}

/// Landing page listing every configured application
pub fn landing_page(apps: &[AppStatus], message: Option<&str>) -> String {
    let mut body = String::from("<h1>Choose an application</h1>\n");

    if let Some(message) = message {
        body.push_str(&format!("<p class=\"message\">{}</p>\n", escape(message)));
    }

    if apps.is_empty() {
        body.push_str("<p>No applications are configured.</p>\n");
    } else {
        body.push_str("<ul class=\"apps\">\n");
        for app in apps {
            let (class, label) = state_label(app.state);
            let name = urlencoding::encode(&app.name);
            body.push_str(&format!(
                concat!(
                    "  <li><a href=\"/streamlit?app={name}\">{display}</a>",
                    " <span class=\"state {class}\">{label}</span>",
                    " <form method=\"post\" action=\"/start-app\">",
                    "<input type=\"hidden\" name=\"selection\" value=\"{value}\">",
                    "<button type=\"submit\">Start</button></form></li>\n"
                ),
                name = name,
                display = escape(&app.display_name),
                class = class,
                label = label,
                value = escape(&app.name),
            ));
        }
        body.push_str("</ul>\n");
    }

    layout("Applications", "", &body)
}

/// Placeholder returned while a child is still starting. Reloads itself.
pub fn placeholder_page(display_name: &str) -> String {
    let head = format!(
        "<meta http-equiv=\"refresh\" content=\"{}\">",
        PLACEHOLDER_REFRESH_SECS
    );
    let body = format!(
        "<h1>Starting {name}&hellip;</h1>\n<p>The application is starting up. This page reloads automatically.</p>\n<p><a href=\"/\">Back to the application list</a></p>\n",
        name = escape(display_name),
    );
    layout(&format!("Starting {}", display_name), &head, &body)
}

/// Error page with a status code, heading and message
pub fn error_page(status: u16, title: &str, message: &str) -> String {
    let body = format!(
        "<h1>{status} &middot; {title}</h1>\n<p>{message}</p>\n<p><a href=\"/\">Back to the application list</a></p>\n",
        status = status,
        title = escape(title),
        message = escape(message),
    );
    layout(title, "", &body)
}
