//! A single proxy session: which pod we run, where, and how we reach it.

use lazy_static::lazy_static;
use regex::Regex;

use crate::prelude::*;

/// The namespace we create proxy pods in by default.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The port used on both ends of the tunnel by default.
pub const DEFAULT_PORT: u16 = 1080;

/// The default name of our proxy pod.
pub const DEFAULT_POD_NAME: &str = "psocks1080";

/// A small public SOCKS5 proxy image. It listens on `$PROXY_PORT`.
pub const DEFAULT_IMAGE: &str = "serjs/go-socks5-proxy";

/// Everything we need to know to create, forward to and clean up a proxy pod.
///
/// This is built once at startup from command-line flags and defaults. The
/// Kubernetes context is always explicit here, even when it came from the
/// user's current `kubectl` context.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProxySession {
    /// The `kubectl` context identifying the cluster.
    pub context: String,
    /// The namespace containing the pod.
    pub namespace: String,
    /// The name of the proxy pod.
    pub pod_name: String,
    /// The port the SOCKS5 proxy listens on inside the pod.
    pub pod_port: u16,
    /// The local port we forward to `pod_port`.
    pub local_port: u16,
    /// The container image running the proxy.
    pub image: String,
    /// Leave the pod running when the session ends.
    pub skip_cleanup: bool,
}

impl ProxySession {
    /// Create a session using our defaults for everything except the
    /// context, which must be resolved by the caller.
    pub fn with_defaults<S: Into<String>>(context: S) -> Self {
        ProxySession {
            context: context.into(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            pod_name: DEFAULT_POD_NAME.to_owned(),
            pod_port: DEFAULT_PORT,
            local_port: DEFAULT_PORT,
            image: DEFAULT_IMAGE.to_owned(),
            skip_cleanup: false,
        }
    }

    /// Check that this session describes something Kubernetes will accept,
    /// before we talk to the cluster at all.
    pub fn validate(&self) -> Result<()> {
        if self.context.trim().is_empty() {
            return Err(format_err!("no Kubernetes context specified"));
        }
        if self.image.trim().is_empty() {
            return Err(format_err!("no proxy image specified"));
        }
        check_dns_label("pod name", &self.pod_name)?;
        check_dns_label("namespace", &self.namespace)?;
        if self.pod_port == 0 {
            return Err(format_err!("pod port must not be 0"));
        }
        if self.local_port == 0 {
            return Err(format_err!("local port must not be 0"));
        }
        Ok(())
    }
}

/// Make sure `value` is a valid RFC 1123 DNS label, which is what Kubernetes
/// requires for pod and namespace names.
fn check_dns_label(what: &str, value: &str) -> Result<()> {
    lazy_static! {
        static ref DNS_LABEL: Regex =
            Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
                .expect("invalid regex in source");
    }

    if value.len() > 63 || !DNS_LABEL.is_match(value) {
        return Err(format_err!(
            "invalid {} {:?}: must be at most 63 lowercase letters, digits or '-', \
             starting and ending with a letter or digit",
            what,
            value,
        ));
    }
    Ok(())
}
