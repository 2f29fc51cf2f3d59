//! Cookie parsing over the raw header list
//!
//! Cookies are parsed lazily from `Cookie` headers on demand and cached by
//! the request message. Malformed pairs are skipped rather than failing the
//! whole header, since clients routinely send junk alongside valid cookies.

use cookie::Cookie;
use tracing::debug;

use crate::message::Headers;

/// Parsed client cookies, in arrival order
#[derive(Debug, Clone, Default)]
pub struct Cookies {
    entries: Vec<Cookie<'static>>,
}

impl Cookies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every `Cookie` header in the list
    #[must_use]
    pub fn parse(headers: &Headers) -> Self {
        let mut cookies = Self::new();
        for value in headers.all("cookie") {
            for parsed in Cookie::split_parse(value) {
                match parsed {
                    Ok(cookie) => cookies.add(cookie.into_owned()),
                    Err(error) => {
                        debug!(%error, "skipping malformed cookie pair");
                    }
                }
            }
        }
        cookies
    }

    pub fn add(&mut self, cookie: Cookie<'static>) {
        self.entries.push(cookie);
    }

    /// First cookie with the given name, if any
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&Cookie<'static>> {
        self.entries.iter().find(|c| c.name() == name)
    }

    /// Every cookie with the given name, in arrival order
    #[must_use]
    pub fn all(&self, name: &str) -> Vec<&Cookie<'static>> {
        self.entries.iter().filter(|c| c.name() == name).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie<'static>> {
        self.entries.iter()
    }
}
