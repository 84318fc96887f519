//! HTML pages served by the gateway.

use quick_xml::escape::escape;

use crate::saml::Attributes;

const TITLE: &str = "Welcome to the SAML Gateway!";

fn page(body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>SAML Gateway</title></head>\n<body>\n{body}</body>\n</html>\n"
    )
}

fn login_form() -> &'static str {
    concat!(
        "<form action=\"/saml/login\" method=\"get\">\n",
        "    <button type=\"submit\">Login via SAML</button>\n",
        "</form>\n"
    )
}

pub fn login_prompt() -> String {
    page(&format!("<h1>{TITLE}</h1>\n{}", login_form()))
}

pub fn already_authenticated() -> String {
    page(&format!(
        concat!(
            "<h1>{}</h1>\n",
            "<p>You are already authenticated.</p>\n",
            "<a href=\"/authenticated\"><button>Go to Authenticated Page</button></a>\n"
        ),
        TITLE
    ))
}

/// The protected page. Every attribute name and value is escaped.
pub fn authenticated(name_id: Option<&str>, attributes: &Attributes) -> String {
    let mut body = String::from(
        "<h1>Authenticated Page</h1>\n<p>Welcome, you have successfully authenticated via SAML.</p>\n",
    );
    if let Some(name_id) = name_id {
        body.push_str(&format!("<p>NameID: {}</p>\n", escape(name_id)));
    }

    body.push_str("<p>User Data:</p>\n<dl>\n");
    for (name, values) in attributes {
        body.push_str(&format!("  <dt>{}</dt>\n", escape(name.as_str())));
        for value in values {
            body.push_str(&format!("  <dd>{}</dd>\n", escape(value.as_str())));
        }
    }
    body.push_str("</dl>\n");
    body.push_str(concat!(
        "<form action=\"/logout\" method=\"get\">\n",
        "    <button type=\"submit\">Logout</button>\n",
        "</form>\n"
    ));
    page(&body)
}

pub fn logged_out() -> String {
    page(&format!("<h1>You have been logged out.</h1>\n{}", login_form()))
}
