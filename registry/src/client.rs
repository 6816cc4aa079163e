// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! HTTP client for the store's v2 key space.

use crate::subnet::{Attrs, Event, make_subnet_key, parse_subnet_key};
use chrono::{DateTime, Utc};
use net::ipv4::Ip4Net;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Namespace the agent's keys live under unless overridden.
pub const DEFAULT_PREFIX: &str = "/vxlan";

/// How long a published subnet lives without a refresh.  Lease renewal is not
/// implemented; a restarted agent re-publishes.
const SUBNET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Applied to every request except watches, which block until an event
/// arrives and are bounded by cancellation instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// The store's "key not found" error code.  Not an error for a recursive
/// read: it is the empty-set signal.
const ERROR_KEY_NOT_FOUND: u64 = 100;

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The configured endpoint does not parse as a URL.
    #[error("invalid store endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    /// The HTTP exchange itself failed (connect, timeout, malformed body).
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The store replied with an error document.
    #[error("store error {code}: {message}")]
    Store { code: u64, message: String },
    /// The attribute payload could not be encoded.
    #[error("failed to encode subnet attributes: {0}")]
    Encode(#[from] serde_json::Error),
    /// The store accepted the write but returned an already-expired node.
    #[error("subnet key {key} was created already expired")]
    Expired { key: String },
    /// A node under the subnet prefix could not be interpreted.
    #[error("bad subnet node {key}: {reason}")]
    BadNode { key: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    action: String,
    node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    modified_index: u64,
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysError {
    error_code: u64,
    message: String,
}

/// A handle on the shared subnet registry.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    endpoint: Url,
    prefix: String,
}

impl RegistryClient {
    /// Create a client for the store at `endpoint` using the default key
    /// prefix.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint does not parse as a URL or the HTTP client
    /// cannot be constructed.
    pub fn new(endpoint: &str) -> Result<RegistryClient, RegistryError> {
        let parsed = Url::parse(endpoint).map_err(|source| RegistryError::Endpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        // fail fast when the endpoint is unreachable; watches get their
        // patience from the caller's cancellation instead
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(RegistryClient {
            http,
            endpoint: parsed,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Use `prefix` instead of [`DEFAULT_PREFIX`] as the key namespace.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> RegistryClient {
        self.prefix = prefix.into();
        self
    }

    fn subnets_url(&self, key: Option<&str>) -> Result<Url, RegistryError> {
        let path = match key {
            None => format!("/v2/keys{}/subnets", self.prefix),
            Some(key) => format!("/v2/keys{}/subnets/{key}", self.prefix),
        };
        self.endpoint
            .join(&path)
            .map_err(|source| RegistryError::Endpoint {
                endpoint: self.endpoint.to_string(),
                source,
            })
    }

    /// Publish this agent's subnet attributes.
    ///
    /// The write is a compare-and-set create (`prevExist=false`) with a
    /// 24-hour TTL: a second agent drawing the same subnet loses the race
    /// and fails at startup.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, on any store error (including "node
    /// exists"), and when the store hands back a node that is somehow
    /// already expired.
    pub async fn create_subnet(&self, subnet: Ip4Net, attrs: &Attrs) -> Result<(), RegistryError> {
        let key = make_subnet_key(subnet);
        let url = self.subnets_url(Some(&key))?;
        let value = serde_json::to_string(attrs)?;
        let ttl = SUBNET_TTL.as_secs().to_string();
        let response = self
            .http
            .put(url)
            .timeout(REQUEST_TIMEOUT)
            .form(&[
                ("value", value.as_str()),
                ("ttl", ttl.as_str()),
                ("prevExist", "false"),
            ])
            .send()
            .await?;
        let body = read_keys_response(response).await?;
        if let Some(expiration) = &body.node.expiration {
            if let Ok(when) = DateTime::parse_from_rfc3339(expiration) {
                if when <= Utc::now() {
                    return Err(RegistryError::Expired { key });
                }
            }
        }
        Ok(())
    }

    /// Read every published subnet.
    ///
    /// Returns the events for all parseable child nodes plus the store index
    /// to resume watching from.  A missing subnets directory is the empty
    /// set, not an error, and carries no resume index.  Unparseable child
    /// nodes are logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails on transport errors and on store errors other than "key not
    /// found".
    pub async fn subnets(&self) -> Result<(Vec<Event>, Option<u64>), RegistryError> {
        let mut url = self.subnets_url(None)?;
        url.set_query(Some("recursive=true&quorum=true"));
        let response = self.http.get(url).timeout(REQUEST_TIMEOUT).send().await?;
        let resume_index = etcd_index(&response);
        if !response.status().is_success() {
            let error: KeysError = response.json().await?;
            if error.error_code == ERROR_KEY_NOT_FOUND {
                return Ok((Vec::new(), None));
            }
            return Err(RegistryError::Store {
                code: error.error_code,
                message: error.message,
            });
        }
        let body: KeysResponse = response.json().await?;
        let mut events = Vec::with_capacity(body.node.nodes.len());
        for node in &body.node.nodes {
            match node_to_event(node) {
                Ok(event) => events.push(event),
                Err(err) => warn!("ignoring bad subnet node: {err}"),
            }
        }
        Ok((events, resume_index))
    }

    /// Block until the first modification under the subnet prefix with an
    /// index strictly greater than `after`, and return it together with its
    /// modification index.
    ///
    /// `delete`/`expire` actions come back as [`Event::Remove`]; everything
    /// else is an [`Event::Add`].
    ///
    /// # Errors
    ///
    /// Fails on transport errors, store errors, and nodes which do not parse
    /// as subnets.  All of these are transient from the watcher's point of
    /// view: it keeps its resume index and retries.
    pub async fn watch_subnet(&self, after: u64) -> Result<(Event, u64), RegistryError> {
        let mut url = self.subnets_url(None)?;
        url.set_query(Some(&format!(
            "wait=true&recursive=true&waitIndex={}",
            after + 1
        )));
        let response = self.http.get(url).send().await?;
        let body = read_keys_response(response).await?;
        let event = watch_response_to_event(&body)?;
        Ok((event, body.node.modified_index))
    }
}

async fn read_keys_response(response: reqwest::Response) -> Result<KeysResponse, RegistryError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        let error: KeysError = response.json().await?;
        Err(RegistryError::Store {
            code: error.error_code,
            message: error.message,
        })
    }
}

fn etcd_index(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("X-Etcd-Index")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn node_to_event(node: &Node) -> Result<Event, RegistryError> {
    if parse_subnet_key(&node.key).is_none() {
        return Err(RegistryError::BadNode {
            key: node.key.clone(),
            reason: "failed to parse subnet key".to_string(),
        });
    }
    let value = node.value.as_deref().ok_or_else(|| RegistryError::BadNode {
        key: node.key.clone(),
        reason: "node has no value".to_string(),
    })?;
    let attrs: Attrs = serde_json::from_str(value).map_err(|err| RegistryError::BadNode {
        key: node.key.clone(),
        reason: err.to_string(),
    })?;
    Ok(Event::Add {
        subnet: attrs.subnet,
        attrs,
    })
}

fn watch_response_to_event(body: &KeysResponse) -> Result<Event, RegistryError> {
    let Some(subnet) = parse_subnet_key(&body.node.key) else {
        return Err(RegistryError::BadNode {
            key: body.node.key.clone(),
            reason: format!("{}: not a subnet", body.action),
        });
    };
    match body.action.as_str() {
        "delete" | "expire" => Ok(Event::Remove { subnet }),
        _ => {
            let value = body
                .node
                .value
                .as_deref()
                .ok_or_else(|| RegistryError::BadNode {
                    key: body.node.key.clone(),
                    reason: "node has no value".to_string(),
                })?;
            let attrs: Attrs = serde_json::from_str(value).map_err(|err| RegistryError::BadNode {
                key: body.node.key.clone(),
                reason: err.to_string(),
            })?;
            Ok(Event::Add { subnet, attrs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KeysResponse, RegistryClient, node_to_event, watch_response_to_event};
    use crate::subnet::Event;
    use net::ipv4::{Ip4, Ip4Net};

    fn subnet() -> Ip4Net {
        Ip4Net::new(Ip4::from_octets([10, 5, 42, 0]), 24)
    }

    const GOOD_VALUE: &str = concat!(
        r#"{\"PublicIP\":3221225995,"#,
        r#"\"Subnet\":{\"IP\":168110592,\"PrefixLen\":24},"#,
        r#"\"HardwareAddr\":\"AgAAAAAL\"}"#,
    );

    fn keys_response(action: &str, with_value: bool) -> KeysResponse {
        let value = if with_value {
            format!(r#","value":"{GOOD_VALUE}""#)
        } else {
            String::new()
        };
        let raw = format!(
            r#"{{"action":"{action}","node":{{"key":"/vxlan/subnets/10.5.42.0-24","modifiedIndex":12{value}}}}}"#
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn set_responses_become_add_events() {
        let body = keys_response("set", true);
        let event = watch_response_to_event(&body).unwrap();
        match event {
            Event::Add { subnet: parsed, attrs } => {
                assert_eq!(parsed, subnet());
                assert_eq!(attrs.subnet, subnet());
                assert_eq!(attrs.public_ip, Ip4::from_octets([192, 0, 2, 11]));
            }
            Event::Remove { .. } => panic!("expected an add event"),
        }
        assert_eq!(body.node.modified_index, 12);
    }

    #[test]
    fn delete_and_expire_become_remove_events() {
        for action in ["delete", "expire"] {
            let body = keys_response(action, false);
            let event = watch_response_to_event(&body).unwrap();
            assert_eq!(event, Event::Remove { subnet: subnet() });
        }
    }

    #[test]
    fn non_subnet_keys_are_bad_nodes() {
        let raw = r#"{"action":"set","node":{"key":"/vxlan/subnets/_config","modifiedIndex":3,"value":"{}"}}"#;
        let body: KeysResponse = serde_json::from_str(raw).unwrap();
        assert!(watch_response_to_event(&body).is_err());
    }

    #[test]
    fn list_nodes_take_the_subnet_from_the_attributes() {
        let body = keys_response("get", true);
        let event = node_to_event(&body.node).unwrap();
        assert_eq!(event.subnet(), subnet());
    }

    #[test]
    fn list_nodes_without_values_are_bad() {
        let body = keys_response("get", false);
        assert!(node_to_event(&body.node).is_err());
    }

    #[test]
    fn urls_carry_the_prefix() {
        let client = RegistryClient::new("http://127.0.0.1:2379").unwrap();
        assert_eq!(
            client.subnets_url(None).unwrap().as_str(),
            "http://127.0.0.1:2379/v2/keys/vxlan/subnets"
        );
        assert_eq!(
            client
                .subnets_url(Some("10.5.42.0-24"))
                .unwrap()
                .as_str(),
            "http://127.0.0.1:2379/v2/keys/vxlan/subnets/10.5.42.0-24"
        );
        let client = client.with_prefix("/overlay-test");
        assert_eq!(
            client.subnets_url(None).unwrap().as_str(),
            "http://127.0.0.1:2379/v2/keys/overlay-test/subnets"
        );
    }
}
