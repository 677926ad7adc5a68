use std::fmt;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// A response cookie with the usual attribute set. `SameSite=Lax` and
/// `HttpOnly` are the defaults; `Secure` is switched on by the kernel when
/// the listener speaks TLS.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expires: Option<SystemTime>,
    pub max_age: Option<Duration>,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Cookie {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            max_age: None,
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }

    /// An expired cookie with the same name, used to clear it client-side.
    pub fn forget<N: Into<String>>(name: N) -> Self {
        let mut cookie = Cookie::new(name, "");
        cookie.expires = Some(SystemTime::UNIX_EPOCH);
        cookie.max_age = Some(Duration::from_secs(0));
        cookie
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn path<P: Into<String>>(mut self, path: P) -> Self {
        self.path = path.into();
        self
    }

    pub fn domain<D: Into<String>>(mut self, domain: D) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            self.name,
            urlencoding::encode(&self.value)
        )?;
        if let Some(expires) = self.expires {
            write!(f, "; Expires={}", httpdate::fmt_http_date(expires))?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age.as_secs())?;
        }
        write!(f, "; Path={}", self.path)?;
        if let Some(ref domain) = self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if self.secure {
            write!(f, "; Secure")?;
        }
        if self.http_only {
            write!(f, "; HttpOnly")?;
        }
        write!(f, "; SameSite={}", self.same_site.as_str())
    }
}

/// Parse a request `Cookie` header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_defaults() {
        let cookie = Cookie::new("session", "abc");
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("session=abc"));
        assert!(rendered.contains("Path=/"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(!rendered.contains("Secure"));
    }

    #[test]
    fn renders_all_attributes() {
        let cookie = Cookie::new("id", "a b")
            .max_age(Duration::from_secs(3600))
            .domain("example.com")
            .secure(true)
            .same_site(SameSite::Strict);
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("id=a%20b"));
        assert!(rendered.contains("Max-Age=3600"));
        assert!(rendered.contains("Domain=example.com"));
        assert!(rendered.contains("Secure"));
        assert!(rendered.contains("SameSite=Strict"));
    }

    #[test]
    fn parses_request_header() {
        let pairs = parse_cookie_header("session=abc; theme=dark");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("session".to_string(), "abc".to_string()));
        assert_eq!(pairs[1], ("theme".to_string(), "dark".to_string()));
    }
}
