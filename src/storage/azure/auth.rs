//! Shared Key authorization for the Blob service.
//!
//! Every request carries `Authorization: SharedKey <account>:<signature>`
//! where the signature is the base64 HMAC-SHA256, keyed with the decoded
//! account key, of a canonical rendering of the request.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use sha2::Sha256;
use url::Url;

pub const API_VERSION: &str = "2021-08-06";

#[derive(Clone)]
pub struct SharedKey {
    account: String,
    mac: Hmac<Sha256>,
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl SharedKey {
    pub fn new(account: &str, access_key: &str) -> Result<Self> {
        let key = STANDARD
            .decode(access_key.trim())
            .context("storage.access_key is not valid base64")?;
        let mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("Invalid storage access key: {e}"))?;
        Ok(Self {
            account: account.to_string(),
            mac,
        })
    }

    /// Value for the `Authorization` header.
    pub fn authorization(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        content_length: u64,
    ) -> String {
        let to_sign = self.string_to_sign(method, url, headers, content_length);
        let mut mac = self.mac.clone();
        mac.update(to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{signature}", self.account)
    }

    /// The Date header is left empty; requests always carry `x-ms-date`.
    /// Only the headers this client sends are rendered, the rest stay blank.
    fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        content_length: u64,
    ) -> String {
        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        // VERB, Content-Encoding, Content-Language, Content-Length,
        // Content-MD5, Content-Type, Date, If-Modified-Since, If-Match,
        // If-None-Match, If-Unmodified-Since, Range
        let mut out = format!(
            "{}\n\n\n{content_length}\n\n{content_type}\n\n\n\n\n\n\n",
            method.as_str()
        );
        out.push_str(&canonical_headers(headers));
        out.push_str(&self.canonical_resource(url));
        out
    }

    fn canonical_resource(&self, url: &Url) -> String {
        let mut out = format!("/{}{}", self.account, url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push_str(&format!("\n{name}:{}", values.join(",")));
        }
        out
    }
}

fn canonical_headers(headers: &HeaderMap) -> String {
    let mut ms: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        if name.as_str().starts_with("x-ms-")
            && let Ok(v) = value.to_str()
        {
            ms.entry(name.as_str()).or_default().push(v.trim());
        }
    }
    ms.into_iter()
        .map(|(name, values)| format!("{name}:{}\n", values.join(",")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    // Azurite's published development account.
    const DEV_ACCOUNT: &str = "devstoreaccount1";
    const DEV_KEY: &str =
        "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
    const DATE: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    fn base_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-ms-date", HeaderValue::from_static(DATE));
        h.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        h
    }

    #[test]
    fn put_blob_signature() {
        let key = SharedKey::new(DEV_ACCOUNT, DEV_KEY).unwrap();
        let url = Url::parse("http://127.0.0.1:10000/devstoreaccount1/docs/reports/a%20b.txt")
            .unwrap();
        let mut headers = base_headers();
        headers.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let expected = "PUT\n\n\n11\n\napplication/octet-stream\n\n\n\n\n\n\n\
                        x-ms-blob-type:BlockBlob\n\
                        x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
                        x-ms-version:2021-08-06\n\
                        /devstoreaccount1/devstoreaccount1/docs/reports/a%20b.txt";
        assert_eq!(key.string_to_sign(&Method::PUT, &url, &headers, 11), expected);
        assert_eq!(
            key.authorization(&Method::PUT, &url, &headers, 11),
            "SharedKey devstoreaccount1:bJvotw22+RUvUCF56bH3IofJFa1nau31Z0hxwO+eDIU="
        );
    }

    #[test]
    fn query_parameters_are_sorted_into_resource() {
        let key = SharedKey::new("myaccount", DEV_KEY).unwrap();
        let url = Url::parse(
            "https://myaccount.blob.core.windows.net/docs/a.txt?comp=block&blockid=YmxvY2stMDAwMDAw",
        )
        .unwrap();
        let headers = base_headers();

        let expected = "HEAD\n\n\n\n\n\n\n\n\n\n\n\n\
                        x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
                        x-ms-version:2021-08-06\n\
                        /myaccount/docs/a.txt\nblockid:YmxvY2stMDAwMDAw\ncomp:block";
        assert_eq!(key.string_to_sign(&Method::HEAD, &url, &headers, 0), expected);
        assert_eq!(
            key.authorization(&Method::HEAD, &url, &headers, 0),
            "SharedKey myaccount:udsqKhNtvQhx69zXFofdNmPO+YkwwVwwiYQglNtNSIw="
        );
    }

    #[test]
    fn rejects_non_base64_key() {
        assert!(SharedKey::new("acct", "not base64 !!").is_err());
    }
}
