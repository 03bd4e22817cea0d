use std::collections::BTreeMap;

use poem::{
    handler,
    http::{header, HeaderValue, StatusCode},
    web::{cookie::Cookie, Path},
    Endpoint, IntoResponse, Request,
};

use crate::Session;

/// In-process client keeping a cookie jar between calls.
#[derive(Default)]
pub(crate) struct TestClient {
    cookies: BTreeMap<String, String>,
}

impl TestClient {
    /// Performs `GET /{action}` and returns the status, the body and the raw
    /// `Set-Cookie` header, if one was emitted.
    pub(crate) async fn call(
        &mut self,
        ep: &impl Endpoint,
        action: &str,
    ) -> (StatusCode, String, Option<String>) {
        let mut req = Request::builder()
            .uri(format!("/{action}").parse().unwrap())
            .finish();

        let mut cookie = String::new();
        for (name, value) in &self.cookies {
            cookie += &format!("{name}={value};");
        }
        if !cookie.is_empty() {
            req.headers_mut()
                .insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        }

        let resp = ep.call(req).await.unwrap().into_response();
        let status = resp.status();

        let mut set_cookie = None;
        for s in resp.headers().get_all(header::SET_COOKIE) {
            if let Ok(s) = s.to_str() {
                set_cookie = Some(s.to_string());
                let cookie = Cookie::parse(s).unwrap();

                if cookie.value_str().is_empty() {
                    self.cookies.remove(cookie.name());
                } else {
                    self.cookies
                        .insert(cookie.name().to_string(), cookie.value_str().to_string());
                }
            }
        }

        let body = resp.into_body().into_string().await.unwrap();
        (status, body, set_cookie)
    }

    /// Returns the token currently held in the jar for the given cookie.
    pub(crate) fn token(&self, name: &str) -> Option<String> {
        self.cookies.get(name).cloned()
    }
}

#[handler]
pub(crate) fn actions(Path(action): Path<String>, session: &Session) -> String {
    let result = match action.as_str() {
        "put" => session.put_string("msg", "lorem ipsum").map(|_| String::new()),
        "get" => session.get_string("msg"),
        "pop" => session.pop_string("msg"),
        "clear" => session.clear().map(|_| String::new()),
        "destroy" => session.destroy().map(|_| String::new()),
        "renew" => session.renew().map(|_| String::new()),
        _ => Ok(String::new()),
    };
    result.unwrap_or_else(|err| err.to_string())
}
