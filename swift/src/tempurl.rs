//! Temporary URL signing
//!
//! ```text
//! temp_url_sig = hex(HMAC-SHA1(secret, "<METHOD>\n<expires>\n<decoded path>"))
//! ```

use hmac::{Hmac, Mac};
use reqwest::{Method, Url};
use sha1::Sha1;

use crate::error::{Error, Result};

pub fn signature(secret: &str, method: &Method, expires: u64, path: &str) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|err| Error::Config(format!("invalid temp url key: {err}")))?;
    mac.update(format!("{}\n{}\n{}", method.as_str(), expires, path).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Appends `temp_url_sig` and `temp_url_expires` to `url`, after any query it already has.
pub fn sign_temp_url(url: &Url, secret: &str, method: &Method, expires: u64) -> Result<Url> {
    let path = urlencoding::decode(url.path())
        .map_err(|err| Error::Config(format!("cannot decode path of {url}: {err}")))?;
    let sig = signature(secret, method, expires, &path)?;
    let mut signed = url.clone();
    signed
        .query_pairs_mut()
        .append_pair("temp_url_sig", &sig)
        .append_pair("temp_url_expires", &expires.to_string());
    Ok(signed)
}
