//! Registry client (component B): fetches packuments and tarballs from an npm-style
//! registry. Generalized from the teacher's inline `reqwest::Client` usage in
//! `DependencyResolver` and `handle_audit_command_async` into a standalone,
//! reusable client with the timeout/redirect/user-agent policy spec.md §4.B spells out.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

const USER_AGENT: &str = concat!("devcore/", env!("CARGO_PKG_VERSION"));
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const TARBALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct VersionMeta {
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: HashMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: HashMap<String, String>,
    pub dist: Dist,
    #[serde(default)]
    pub bin: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub shasum: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Packument {
    pub versions: HashMap<String, VersionMeta>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: HashMap<String, String>,
}

pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::with_base_url("https://registry.npmjs.org")
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn encode_name(name: &str) -> String {
        const ENCODE_SET: &AsciiSet = &CONTROLS.add(b'/').add(b'@');
        if let Some(rest) = name.strip_prefix('@') {
            // preserve the leading '@' and the scope separator, encode the rest
            let mut parts = rest.splitn(2, '/');
            let scope = parts.next().unwrap_or("");
            let pkg = parts.next().unwrap_or("");
            format!(
                "@{}%2F{}",
                utf8_percent_encode(scope, ENCODE_SET),
                utf8_percent_encode(pkg, ENCODE_SET)
            )
        } else {
            utf8_percent_encode(name, ENCODE_SET).to_string()
        }
    }

    pub async fn fetch_packument(&self, name: &str) -> Result<Packument, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/{}", self.base_url, Self::encode_name(name));
        let response = self
            .client
            .get(&url)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(format!("package not found: {name}").into()),
            200 => Ok(response.json::<Packument>().await?),
            code => Err(format!("HTTP {code}").into()),
        }
    }

    pub async fn download_tarball(&self, url: &str) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let response = self.client.get(url).timeout(TARBALL_TIMEOUT).send().await?;

        match response.status().as_u16() {
            404 => Err(format!("tarball not found: {url}").into()),
            200 => Ok(response.bytes().await?.to_vec()),
            code => Err(format!("HTTP {code}").into()),
        }
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_scoped_package_names() {
        assert_eq!(RegistryClient::encode_name("left-pad"), "left-pad");
        assert_eq!(RegistryClient::encode_name("@scope/pkg"), "@scope%2Fpkg");
    }
}
