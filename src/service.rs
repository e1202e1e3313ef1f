//! Service definitions: the unit of routing configuration
//!
//! A `ServiceDefinition` is built from an inbound request (query string or
//! CLI flags), normalized, validated, persisted to the registry as a flat
//! attribute map and read back from it when the configuration is rebuilt.

use crate::config::Mode;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message returned when neither a path nor a custom frontend template is given
pub const MANDATORY_QUERIES_MESSAGE: &str = "The following queries are mandatory: (serviceName and servicePath) or (serviceName, consulTemplateFePath, and consulTemplateBePath)";

/// Message returned when an orchestrator mode request carries no port
pub const PORT_MANDATORY_MESSAGE: &str =
    r#"When MODE is set to "service" or "swarm", the port query is mandatory"#;

/// Message returned by remove requests without a service name
pub const SERVICE_NAME_MANDATORY_MESSAGE: &str = "The serviceName query is mandatory";

const DEFAULT_PATH_TYPE: &str = "path_beg";

/// Registry attribute keys, one key/value pair per attribute
pub const ATTRIBUTE_KEYS: &[&str] = &[
    "color",
    "path",
    "domain",
    "hostname",
    "pathtype",
    "skipcheck",
    "consultemplatefepath",
    "consultemplatebepath",
    "templatefepath",
    "templatebepath",
    "port",
    "httpsport",
    "aclname",
    "users",
    "reqrepsearch",
    "reqrepreplace",
    "certname",
];

/// Basic auth user of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub username: String,
    pub password: String,
}

impl User {
    /// Parse a `user:pass` pair
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.split_once(':') {
            Some((username, password)) if !username.is_empty() => Ok(Self {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err(ProxyError::invalid(format!(
                "Invalid users entry \"{}\", expected user:password",
                entry
            ))),
        }
    }

    /// Parse a comma separated list of `user:pass` pairs
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(User::parse)
            .collect()
    }
}

/// Routing configuration of one logical service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDefinition {
    pub service_name: String,
    pub acl_name: String,
    pub service_color: String,
    pub service_path: Vec<String>,
    pub service_domain: Vec<String>,
    /// Certificate payload attached to the request; never persisted
    pub service_cert: String,
    pub outbound_hostname: String,
    pub consul_template_fe_path: String,
    pub consul_template_be_path: String,
    pub path_type: String,
    pub skip_check: bool,
    pub mode: Mode,
    pub port: String,
    pub https_port: Option<u16>,
    pub distribute: bool,
    pub users: Vec<User>,
    pub req_rep_search: String,
    pub req_rep_replace: String,
    pub template_fe_path: String,
    pub template_be_path: String,
    /// Name of the stored certificate this service installed
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert_name: String,
}

/// Decoded query string of an inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    /// Decode `a=1&b=x%2Cy` style query strings. Undecodable values are kept raw.
    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode(key), decode(value))
            })
            .collect();
        Self { pairs }
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            pairs: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// First value of `key`, or an empty string
    pub fn get(&self, key: &str) -> &str {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Boolean value of `key`; absent or unparseable values are false
    pub fn get_bool(&self, key: &str) -> bool {
        parse_bool(self.get(key)).unwrap_or(false)
    }

    /// Replace every occurrence of `key` with a single pair
    pub fn set(&mut self, key: &str, value: &str) {
        self.pairs.retain(|(k, _)| k != key);
        self.pairs.push((key.to_string(), value.to_string()));
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Re-encode as a query string
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Boolean literals accepted in query parameters
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ServiceDefinition {
    /// A definition carrying only a name, as echoed by remove requests
    pub fn named(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build a definition from reconfigure query parameters
    pub fn from_query(query: &Query, mode: Mode) -> Result<Self> {
        let https_port = match query.get("httpsPort") {
            "" => None,
            raw => Some(raw.parse::<u16>().map_err(|_| {
                ProxyError::invalid(format!("httpsPort {} is not a valid port number", raw))
            })?),
        };

        Ok(Self {
            service_name: query.get("serviceName").to_string(),
            acl_name: query.get("aclName").to_string(),
            service_color: query.get("serviceColor").to_string(),
            service_path: split_list(query.get("servicePath")),
            service_domain: split_list(query.get("serviceDomain")),
            service_cert: query.get("serviceCert").to_string(),
            outbound_hostname: query.get("outboundHostname").to_string(),
            consul_template_fe_path: query.get("consulTemplateFePath").to_string(),
            consul_template_be_path: query.get("consulTemplateBePath").to_string(),
            path_type: query.get("pathType").to_string(),
            skip_check: query.get_bool("skipCheck"),
            mode,
            port: query.get("port").to_string(),
            https_port,
            distribute: query.get_bool("distribute"),
            users: User::parse_list(query.get("users"))?,
            req_rep_search: query.get("reqRepSearch").to_string(),
            req_rep_replace: query.get("reqRepReplace").to_string(),
            template_fe_path: query.get("templateFePath").to_string(),
            template_be_path: query.get("templateBePath").to_string(),
            cert_name: String::new(),
        })
    }

    /// Apply defaults and unescape the certificate payload
    pub fn normalize(&mut self) {
        self.service_name = self.service_name.trim().to_string();
        if self.acl_name.is_empty() {
            self.acl_name = self.service_name.clone();
        }
        if self.path_type.is_empty() {
            self.path_type = DEFAULT_PATH_TYPE.to_string();
        }
        if !self.service_cert.is_empty() {
            // Labels cannot carry new lines, so certificates arrive with literal "\n"
            self.service_cert = self.service_cert.replace("\\n", "\n");
        }
    }

    /// Check the definition invariants for the given operating mode
    pub fn validate(&self, mode: Mode) -> Result<()> {
        let has_route = !self.service_path.is_empty() || self.frontend_template().is_some();
        if self.service_name.trim().is_empty() || !has_route {
            return Err(ProxyError::invalid(MANDATORY_QUERIES_MESSAGE));
        }
        if mode.requires_port() && self.port.is_empty() {
            return Err(ProxyError::invalid(PORT_MANDATORY_MESSAGE));
        }
        if !self.port.is_empty() && self.port_number().is_none() {
            return Err(ProxyError::invalid(format!(
                "port {} is not a valid port number",
                self.port
            )));
        }
        Ok(())
    }

    pub fn port_number(&self) -> Option<u16> {
        self.port.parse().ok()
    }

    /// ACL identifier used in the frontend
    pub fn acl(&self) -> &str {
        if self.acl_name.is_empty() {
            &self.service_name
        } else {
            &self.acl_name
        }
    }

    /// Host requests are forwarded to
    pub fn target_host(&self) -> String {
        if !self.outbound_hostname.is_empty() {
            self.outbound_hostname.clone()
        } else if !self.service_color.is_empty() {
            format!("{}-{}", self.service_name, self.service_color)
        } else {
            self.service_name.clone()
        }
    }

    /// Port traffic is forwarded to; services registered without one use 80
    pub fn effective_port(&self) -> &str {
        if self.port.is_empty() {
            "80"
        } else {
            &self.port
        }
    }

    pub fn backend_name(&self) -> String {
        format!("{}-be{}", self.service_name, self.effective_port())
    }

    pub fn https_backend_name(&self) -> Option<String> {
        self.https_port
            .map(|port| format!("https-{}-be{}", self.service_name, port))
    }

    /// Custom frontend fragment path, if any
    pub fn frontend_template(&self) -> Option<&str> {
        [&self.template_fe_path, &self.consul_template_fe_path]
            .into_iter()
            .find(|p| !p.is_empty())
            .map(String::as_str)
    }

    /// Custom backend fragment path, if any
    pub fn backend_template(&self) -> Option<&str> {
        [&self.template_be_path, &self.consul_template_be_path]
            .into_iter()
            .find(|p| !p.is_empty())
            .map(String::as_str)
    }

    /// Name the attached certificate is stored under: first domain, else service name
    pub fn cert_storage_name(&self) -> &str {
        self.service_domain
            .first()
            .map(String::as_str)
            .unwrap_or(&self.service_name)
    }

    /// Flatten into registry attributes. Every key is written so that
    /// a later update clears attributes the new request no longer sets.
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let users = self
            .users
            .iter()
            .map(|u| format!("{}:{}", u.username, u.password))
            .collect::<Vec<_>>()
            .join(",");
        let values = [
            ("color", self.service_color.clone()),
            ("path", self.service_path.join(",")),
            ("domain", self.service_domain.join(",")),
            ("hostname", self.outbound_hostname.clone()),
            ("pathtype", self.path_type.clone()),
            ("skipcheck", self.skip_check.to_string()),
            ("consultemplatefepath", self.consul_template_fe_path.clone()),
            ("consultemplatebepath", self.consul_template_be_path.clone()),
            ("templatefepath", self.template_fe_path.clone()),
            ("templatebepath", self.template_be_path.clone()),
            ("port", self.port.clone()),
            (
                "httpsport",
                self.https_port.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("aclname", self.acl_name.clone()),
            ("users", users),
            ("reqrepsearch", self.req_rep_search.clone()),
            ("reqrepreplace", self.req_rep_replace.clone()),
            ("certname", self.cert_name.clone()),
        ];
        values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// Rebuild a definition from registry attributes; missing keys take defaults
    pub fn from_attributes(name: &str, attributes: &BTreeMap<String, String>, mode: Mode) -> Self {
        let get = |key: &str| attributes.get(key).cloned().unwrap_or_default();
        let mut definition = Self {
            service_name: name.to_string(),
            acl_name: get("aclname"),
            service_color: get("color"),
            service_path: split_list(&get("path")),
            service_domain: split_list(&get("domain")),
            outbound_hostname: get("hostname"),
            consul_template_fe_path: get("consultemplatefepath"),
            consul_template_be_path: get("consultemplatebepath"),
            path_type: get("pathtype"),
            skip_check: parse_bool(&get("skipcheck")).unwrap_or(false),
            mode,
            port: get("port"),
            https_port: get("httpsport").parse().ok(),
            // Stored entries were validated on the way in; a damaged users entry is dropped.
            users: User::parse_list(&get("users")).unwrap_or_default(),
            req_rep_search: get("reqrepsearch"),
            req_rep_replace: get("reqrepreplace"),
            template_fe_path: get("templatefepath"),
            template_be_path: get("templatebepath"),
            cert_name: get("certname"),
            ..Self::default()
        };
        definition.normalize();
        definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_query() -> Query {
        Query::parse(
            "serviceName=web&servicePath=/api,/v2&serviceDomain=example.com&port=8080&users=alice:secret,bob:pass&skipCheck=true&httpsPort=8443",
        )
    }

    #[test]
    fn test_from_query() {
        let def = ServiceDefinition::from_query(&web_query(), Mode::Default).unwrap();
        assert_eq!(def.service_name, "web");
        assert_eq!(def.service_path, vec!["/api", "/v2"]);
        assert_eq!(def.service_domain, vec!["example.com"]);
        assert_eq!(def.port, "8080");
        assert_eq!(def.https_port, Some(8443));
        assert!(def.skip_check);
        assert!(!def.distribute);
        assert_eq!(
            def.users,
            vec![
                User { username: "alice".into(), password: "secret".into() },
                User { username: "bob".into(), password: "pass".into() },
            ]
        );
    }

    #[test]
    fn test_query_decoding() {
        let query = Query::parse("servicePath=%2Fapi%2C%2Fv2&reqRepSearch=a+b&flag");
        assert_eq!(query.get("servicePath"), "/api,/v2");
        assert_eq!(query.get("reqRepSearch"), "a b");
        assert_eq!(query.get("flag"), "");
        assert_eq!(query.get("missing"), "");
    }

    #[test]
    fn test_query_set_replaces_existing() {
        let mut query = Query::parse("serviceName=web&distribute=true&distribute=1");
        query.set("distribute", "false");
        assert!(!query.get_bool("distribute"));
        assert_eq!(query.encode(), "serviceName=web&distribute=false");
    }

    #[test]
    fn test_malformed_users_is_invalid() {
        let query = Query::parse("serviceName=web&servicePath=/api&users=alice");
        let err = ServiceDefinition::from_query(&query, Mode::Default).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidDefinition(_)));
    }

    #[test]
    fn test_invalid_https_port() {
        let query = Query::parse("serviceName=web&servicePath=/api&httpsPort=abc");
        assert!(ServiceDefinition::from_query(&query, Mode::Default).is_err());
    }

    #[test]
    fn test_validate_requires_name() {
        let mut def = ServiceDefinition::from_query(&web_query(), Mode::Default).unwrap();
        def.service_name = String::new();
        let err = def.validate(Mode::Default).unwrap_err();
        assert_eq!(err.to_string(), MANDATORY_QUERIES_MESSAGE);
    }

    #[test]
    fn test_validate_requires_path_or_template() {
        let mut def = ServiceDefinition::named("web");
        assert!(def.validate(Mode::Default).is_err());

        def.consul_template_fe_path = "/consul_templates/web-fe.tmpl".into();
        assert!(def.validate(Mode::Default).is_ok());

        def.consul_template_fe_path.clear();
        def.template_fe_path = "web-fe.cfg".into();
        assert!(def.validate(Mode::Default).is_ok());
    }

    #[test]
    fn test_validate_port_mandatory_in_swarm_mode() {
        let query = Query::parse("serviceName=web&servicePath=/api");
        let def = ServiceDefinition::from_query(&query, Mode::Swarm).unwrap();
        let err = def.validate(Mode::Swarm).unwrap_err();
        assert_eq!(err.to_string(), PORT_MANDATORY_MESSAGE);
        assert!(def.validate(Mode::Default).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_numeric_port() {
        let query = Query::parse("serviceName=web&servicePath=/api&port=http");
        let def = ServiceDefinition::from_query(&query, Mode::Default).unwrap();
        assert!(def.validate(Mode::Default).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut def = ServiceDefinition::named("web");
        def.service_cert = "-----BEGIN CERTIFICATE-----\\nMIIB\\n-----END CERTIFICATE-----".into();
        def.normalize();
        assert_eq!(def.acl_name, "web");
        assert_eq!(def.path_type, "path_beg");
        assert_eq!(
            def.service_cert,
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"
        );
    }

    #[test]
    fn test_attributes_rebuild_definition() {
        let mut def = ServiceDefinition::from_query(&web_query(), Mode::Default).unwrap();
        def.service_color = "blue".into();
        def.normalize();

        let attributes = def.to_attributes();
        assert_eq!(attributes.len(), ATTRIBUTE_KEYS.len());
        assert_eq!(attributes["path"], "/api,/v2");
        assert_eq!(attributes["users"], "alice:secret,bob:pass");

        let rebuilt = ServiceDefinition::from_attributes("web", &attributes, Mode::Default);
        assert_eq!(rebuilt.service_path, def.service_path);
        assert_eq!(rebuilt.users, def.users);
        assert_eq!(rebuilt.https_port, Some(8443));
        assert_eq!(rebuilt.target_host(), "web-blue");
        // The certificate payload is transient
        assert!(rebuilt.service_cert.is_empty());
    }

    #[test]
    fn test_naming_helpers() {
        let mut def = ServiceDefinition::from_query(&web_query(), Mode::Default).unwrap();
        assert_eq!(def.backend_name(), "web-be8080");
        assert_eq!(def.https_backend_name().as_deref(), Some("https-web-be8443"));
        assert_eq!(def.cert_storage_name(), "example.com");
        assert_eq!(def.acl(), "web");

        def.service_domain.clear();
        def.outbound_hostname = "web.internal".into();
        assert_eq!(def.cert_storage_name(), "web");
        assert_eq!(def.target_host(), "web.internal");
    }

    #[test]
    fn test_serializes_pascal_case() {
        let def = ServiceDefinition::from_query(&web_query(), Mode::Default).unwrap();
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["ServiceName"], "web");
        assert_eq!(json["ServicePath"][0], "/api");
        assert_eq!(json["Port"], "8080");
        assert_eq!(json["HttpsPort"], 8443);
        assert_eq!(json["Users"][0]["Username"], "alice");
        assert!(json.get("CertName").is_none());
    }
}
