//! Pure rendering of HAProxy configuration text from service definitions

use super::EngineError;
use crate::service::ServiceDefinition;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Global and defaults sections used when no `haproxy.tmpl` is present
pub const DEFAULT_HEADER: &str = "global
    pidfile /var/run/haproxy.pid
    tune.ssl.default-dh-param 2048

defaults
    mode    http
    balance roundrobin
    option  dontlognull
    option  forwardfor
    option  http-server-close
    timeout connect 5s
    timeout client  20s
    timeout server  20s
    timeout queue   30s
    timeout http-request 5s
    timeout http-keep-alive 15s
";

const INDENT: &str = "    ";

/// Deterministic renderer: the same services, certificates and fragments
/// always produce the same text
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    header: String,
}

impl Default for ConfigRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER)
    }
}

fn line(out: &mut String, text: &str) {
    out.push_str(INDENT);
    out.push_str(text);
    out.push('\n');
}

/// Fill the placeholders a custom fragment may use
pub fn substitute(fragment: &str, service: &ServiceDefinition) -> String {
    fragment
        .replace("{{.ServiceName}}", &service.service_name)
        .replace("{{.Port}}", service.effective_port())
        .replace("{{.AclName}}", service.acl())
        .replace("{{.Host}}", &service.target_host())
}

impl ConfigRenderer {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    /// Render the full configuration.
    ///
    /// `fragments` maps custom template paths to their content; a service
    /// referencing a path missing from it is a render error.
    pub fn render(
        &self,
        services: &[ServiceDefinition],
        certs: &BTreeMap<String, PathBuf>,
        fragments: &BTreeMap<String, String>,
    ) -> Result<String, EngineError> {
        let mut sorted: Vec<&ServiceDefinition> = services.iter().collect();
        sorted.sort_by(|a, b| a.service_name.cmp(&b.service_name));

        let mut out = String::with_capacity(self.header.len() + 256 * sorted.len());
        out.push_str(self.header.trim_end());
        out.push_str("\n\n");

        out.push_str("frontend services\n");
        line(&mut out, "bind *:80");
        if !certs.is_empty() {
            let crts: Vec<String> = certs
                .values()
                .map(|path| format!("crt {}", path.display()))
                .collect();
            line(&mut out, &format!("bind *:443 ssl {}", crts.join(" ")));
        }
        line(&mut out, "mode http");
        for service in &sorted {
            match service.frontend_template() {
                Some(path) => {
                    let fragment = fetch(fragments, path, service)?;
                    push_fragment(&mut out, &substitute(fragment, service));
                }
                None => render_frontend(&mut out, service),
            }
        }

        for service in &sorted {
            if !service.users.is_empty() {
                out.push('\n');
                out.push_str(&format!("userlist {}Users\n", service.service_name));
                for user in &service.users {
                    line(
                        &mut out,
                        &format!("user {} insecure-password {}", user.username, user.password),
                    );
                }
            }
            match service.backend_template() {
                Some(path) => {
                    let fragment = fetch(fragments, path, service)?;
                    out.push('\n');
                    push_fragment(&mut out, &substitute(fragment, service));
                }
                None => {
                    if let Some(https_port) = service.https_port {
                        let name = format!("https-{}-be{}", service.service_name, https_port);
                        render_backend(&mut out, service, &name, &https_port.to_string());
                    }
                    render_backend(&mut out, service, &service.backend_name(), service.effective_port());
                }
            }
        }

        Ok(out)
    }
}

fn fetch<'a>(
    fragments: &'a BTreeMap<String, String>,
    path: &str,
    service: &ServiceDefinition,
) -> Result<&'a str, EngineError> {
    fragments.get(path).map(String::as_str).ok_or_else(|| {
        EngineError::Render(format!(
            "template {} of service {} could not be loaded",
            path, service.service_name
        ))
    })
}

fn push_fragment(out: &mut String, fragment: &str) {
    let fragment = fragment.trim_end();
    if fragment.is_empty() {
        return;
    }
    out.push_str(fragment);
    out.push('\n');
}

fn render_frontend(out: &mut String, service: &ServiceDefinition) {
    if service.service_path.is_empty() {
        return;
    }
    let acl = service.acl();
    line(
        out,
        &format!("acl url_{} {} {}", acl, service.path_type, service.service_path.join(" ")),
    );
    let mut condition = format!("url_{}", acl);
    if !service.service_domain.is_empty() {
        line(
            out,
            &format!("acl domain_{} hdr_dom(host) -i {}", acl, service.service_domain.join(" ")),
        );
        condition.push_str(&format!(" domain_{}", acl));
    }
    if let Some(https_backend) = service.https_backend_name() {
        line(out, &format!("use_backend {} if {} {{ ssl_fc }}", https_backend, condition));
    }
    line(out, &format!("use_backend {} if {}", service.backend_name(), condition));
}

fn render_backend(out: &mut String, service: &ServiceDefinition, name: &str, port: &str) {
    out.push('\n');
    out.push_str(&format!("backend {}\n", name));
    line(out, "mode http");
    if !service.req_rep_search.is_empty() {
        line(
            out,
            &format!("reqrep {}     {}", service.req_rep_search, service.req_rep_replace),
        );
    }
    if !service.users.is_empty() {
        let name = &service.service_name;
        line(out, &format!("acl {}UsersAcl http_auth({}Users)", name, name));
        line(out, &format!("http-request auth realm {}Realm if !{}UsersAcl", name, name));
    }
    let check = if service.skip_check { "" } else { " check" };
    line(
        out,
        &format!("server {} {}:{}{}", service.service_name, service.target_host(), port, check),
    );
}
